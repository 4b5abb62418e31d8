//! # Building operating system images
//!
//! This crate reads YAML recipes describing a sequence of actions
//! (partitioning an image, populating a root filesystem, running scripts)
//! and executes them, optionally inside a fakemachine sandbox.

pub mod cli;

mod action;
mod actions;
mod context;
mod debug_shell;
mod machine;
mod pipeline;
mod recipe;
mod task;
