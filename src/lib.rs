//! BLE Channel Sounding link-layer core and connection handover.
//!
//! Tries to adhere to the *Bluetooth Core Specification v6.0*, Vol 6, Part H (Channel Sounding).
//!
//! # Using the crate
//!
//! Like the rest of the stack, this crate is runtime and hardware-agnostic. It never touches the
//! radio itself: it computes what every CS step does and hands lists of steps to a radio command
//! scheduler, which executes them and reports the results back.
//!
//! The [`Controller`] ties everything together. It needs a few services from the platform, all of
//! which are selected through the [`Config`] trait:
//! * An AES-128 [`BlockCipher`] driving the CS random bit generator.
//! * A [`RadioScheduler`] that executes step lists.
//! * A [`Host`] that receives step results and procedure events.
//! * A [`Multiplexer`] holding the L2CAP channels that move with a connection handover.
//!
//! [`Controller`]: controller/struct.Controller.html
//! [`Config`]: config/trait.Config.html
//! [`BlockCipher`]: crypto/trait.BlockCipher.html
//! [`RadioScheduler`]: cs/procedure/trait.RadioScheduler.html
//! [`Host`]: cs/report/trait.Host.html
//! [`Multiplexer`]: l2cap/trait.Multiplexer.html

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod cs;
mod error;
pub mod handover;
pub mod l2cap;
pub mod link;
pub mod time;

pub use self::controller::Controller;
pub use self::error::Error;
