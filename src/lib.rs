//! Greedy prior selection and cross-validation experiments for host-guest
//! energy regression.

pub mod catalog;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod render;
pub mod selection;
pub mod service;

#[cfg(test)]
mod testing;
