//! Core data types shared by the exploration engine

pub mod action_type;
pub mod ui_tree;
