#![doc = include_str!("../README.md")]

extern crate alloc;

use anyhow as _;
use clap as _;
use env_logger as _;

pub mod bootloader;
pub mod command;
pub mod convert;
pub mod device;
pub mod engine;
pub mod exec;
pub mod filler;
pub mod interrupt;
pub mod mount;
pub mod registry;
pub mod remote;

pub use crate::{
    engine::{Engine, EngineBuilder, Phase},
    exec::{Executor, LocalExecutor, SshExecutor},
    filler::{CommandFiller, Filler},
    interrupt::InterruptGuard,
    remote::{RemoteBridge, SshfsBridge},
};
