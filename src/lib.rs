pub mod benchmarks;
pub mod build;
pub mod command;
pub mod config;
pub mod git;
pub mod home;
pub mod lock;
pub mod node;
pub mod path_utils;
pub mod process;
pub mod system;
pub mod system_info;
