pub mod acquire;
pub mod app;
pub mod assemble;
pub mod catalog;
pub mod config;
pub mod datapackage;
pub mod digest;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod generate;
pub mod naming;
pub mod output;
pub mod selection;
pub mod store;
pub mod tui;
pub mod zenodo;
