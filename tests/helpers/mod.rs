#![allow(dead_code)]

pub mod db;
pub mod fixtures;
pub mod http;

pub use db::TestDb;
pub use fixtures::{authorizer, authorizer_for, compiled_authorizer, facts};
