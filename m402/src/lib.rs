#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Merchant-side payment verification for HTTP-402 style paid resources.
//!
//! A caller asks for a protected resource. Without a payment proof it gets a
//! challenge naming the price, token and trusted facilitator. With a proof,
//! the engine checks that the proof is bound to this resource and price, is
//! still fresh, carries a valid facilitator signature and has never been
//! used before, then records it as consumed and releases the data.
//!
//! # Overview
//!
//! Each accepted payment unlocks exactly one access. The consumed-payment
//! ledger is the only shared mutable state, and its single write is an
//! atomic insert-if-absent, so concurrent submissions of the same proof
//! produce at most one grant.
//!
//! # Modules
//!
//! - [`catalog`] - Protected resources and their fixed terms
//! - [`challenge`] - Payment challenges derived from the catalog
//! - [`config`] - Serde configuration and engine builders
//! - [`encoding`] - Base64 byte wrapper used on the wire
//! - [`gateway`] - The access entry point and resource data providers
//! - [`ledger`] - Consumed-payment ledger trait with memory and sled backends
//! - [`proto`] - Wire format types and rejection reason codes
//! - [`signature`] - Canonical message, facilitator keys and Ed25519 checks
//! - [`timestamp`] - Unix timestamps and injectable clocks
//! - [`validator`] - The ordered proof validation pipeline
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing of grants, rejections and ledger failures

pub mod catalog;
pub mod challenge;
pub mod config;
pub mod encoding;
pub mod gateway;
pub mod ledger;
pub mod proto;
pub mod signature;
pub mod timestamp;
pub mod validator;

pub use gateway::{AccessGateway, AccessOutcome, Authorization, GatewayError};
pub use proto::{ErrorReason, PaymentChallenge, PaymentProof};
pub use validator::{Grant, PaymentValidator, ValidationError};
