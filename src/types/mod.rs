//! Shared type definitions
//!
//! This module contains the plain data types shared by the inference and server layers.

pub mod config;
pub mod model;
