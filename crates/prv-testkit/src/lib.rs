//! # PRV Testkit
//!
//! Testing utilities for the PRV engine.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Protocol vectors**: one fixed PDU per body kind with its expected frame header
//! - **Generators**: Proptest strategies for every PDU body
//! - **Fixtures**: two-party setups that exchange PDUs through their routers
//!
//! ## Protocol Vectors
//!
//! ```rust
//! use prv_testkit::vectors::{all_vectors, verify_all_vectors};
//!
//! for vector in all_vectors() {
//!     let text = prv_core::codec::encode(&vector.pdu);
//!     println!("{}: {}", vector.name, text);
//! }
//! verify_all_vectors().unwrap();
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use prv_testkit::generators::pdu;
//!
//! proptest! {
//!     #[test]
//!     fn roundtrip(pdu in pdu()) {
//!         let text = prv_core::codec::encode(&pdu);
//!         prop_assert_eq!(prv_core::codec::decode(text.as_bytes()).unwrap(), pdu);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use prv_testkit::fixtures::connected_pair;
//!
//! let (alice, bob) = connected_pair(&"chat-1".into()).await?;
//! let shared = alice.encrypt(&"chat-1".into(), b"hello", Default::default()).await?;
//! bob.deliver(&shared.outgoing[0]).await?;
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{connect, connected_pair, init_tracing, two_party, Party, START};
pub use generators::{pdu, pdu_body};
pub use vectors::{all_vectors, verify_all_vectors, ProtocolVector};
