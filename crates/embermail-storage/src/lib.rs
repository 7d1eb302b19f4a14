//! Embermail Storage - PostgreSQL persistence layer
//!
//! This crate provides the relational store shared by all warmup workers:
//! mailboxes, plan entries, messages and spam events.

pub mod db;
pub mod models;
pub mod repository;

pub use db::{Database, DatabasePool};
pub use models::*;
pub use repository::*;
