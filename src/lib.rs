#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod rate_limit;
pub mod rest;

pub type Result<T> = std::result::Result<T, error::Error>;
