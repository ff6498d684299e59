//! File system helpers: manifest traversal and tree copies.

pub mod tree;
pub mod walker;
