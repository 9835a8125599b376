//! API module

pub mod dto;
pub mod rest;
