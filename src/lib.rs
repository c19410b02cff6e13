//! # Bombuh Component Runtime
//!
//! Slave-side runtime for the peripheral modules of a defusable bomb game. A
//! central bus master polls every module over I2C; each module runs this
//! crate to talk to it without ever blocking its cooperative main loop.
//!
//! ## Features
//!
//! - **Promise transport**: continuation chains over interrupt-driven I2C reads and writes
//! - **Bomb client protocol**: framed packets, discovery, handshake, events and an 8-slot request pool
//! - **Cooperative scheduler**: chainable, cancellable events with interrupt-safe queueing
//! - **Component lifecycle**: deferred standby/arm/reset transitions and a two-phase config handshake
//! - **Host simulation**: virtual bus and bus master for tests and the `bombuh-sim` binary
//!
//! ## Quick Start
//!
//! ```rust
//! use bombuh::bconf::ModuleFlags;
//! use bombuh::bus::{self, VirtualBus};
//! use bombuh::component::{BombComponent, ComponentIdentity};
//! use bombuh::ComponentRuntime;
//!
//! struct Button;
//!
//! impl BombComponent for Button {
//!     fn identity(&self) -> ComponentIdentity {
//!         ComponentIdentity::module("Button", ModuleFlags::DEFUSABLE)
//!     }
//! }
//!
//! let mut runtime = ComponentRuntime::new(Button);
//! let address = runtime.setup(0x30).unwrap();
//! assert_eq!(address, 0x30);
//!
//! // The master probes the bus and the component answers.
//! let mut bus = VirtualBus::new();
//! bus::transmit(&mut runtime, &mut bus, &[0xEA]);
//! assert_eq!(bus::request(&mut runtime, &mut bus, 1), vec![0xAE]);
//!
//! // Main loop
//! runtime.tick(0);
//! ```
//!
//! ## Architecture
//!
//! - [`promise`] / [`transport`] - promise chains and the I2C read/write queues
//! - [`client`] - packet framing, command dispatch and the request pool
//! - [`event`] - cooperative event scheduler
//! - [`bconf`] / [`config`] / [`info`] - wire identifiers, config blobs and the handshake schema
//! - [`interface`] / [`component`] / [`runtime`] - lifecycle of one component
//! - [`bus`] / [`master`] / [`sim`] - host-side simulation of the bus

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod address;
pub mod bconf;
pub mod bus;
pub mod client;
pub mod component;
pub mod config;
pub mod event;
pub mod hash;
pub mod info;
pub mod interface;
pub mod master;
pub mod promise;
pub mod runtime;
pub mod sim;
pub mod transport;

// Re-export main public types for convenience
pub use client::{BombClient, ClientError, RequestPool};
pub use component::{BombComponent, BombHandle, ComponentIdentity, DefusableModule};
pub use event::{Event, EventChainHandle, EventManager, EventMutex, EventQueue};
pub use promise::{Promise, Response};
pub use runtime::ComponentRuntime;
pub use transport::{AsyncI2c, ServiceOrder};
