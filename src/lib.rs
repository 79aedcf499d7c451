#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # avb-streamhandler
//!
//! An IEEE 1722 AVTP stream handler for AVB/TSN audio: SAF16 audio
//! streams and clock-reference-format (CRF) streams, clock-domain rate
//! recovery synchronized to IEEE 802.1AS (gPTP), and the engine that
//! ties them together.
//!
//! ## Module overview
//!
//! - [`tspec`]: stream-reservation traffic specifications (class A/B
//!   observation intervals, VLAN priority, bandwidth math).
//! - [`ptp`]: the [`ptp::PtpProxy`] trait abstracting the gPTP time
//!   source, with a system-clock-backed and a fake-for-tests
//!   implementation.
//! - [`clock`]: [`clock::ClockDomain`], the rate-ratio filter and lock
//!   state machine shared by every clock source variant, plus
//!   [`clock::controller`]'s hardware-PLL steering loop.
//! - [`avtp`]: wire-format encode/decode for audio and CRF packets.
//! - [`localaudio`]: the local audio ring buffer and descriptor FIFO an
//!   AVB stream and an ALSA-style producer/consumer share.
//! - [`stream`]: [`stream::audio::AudioStream`] and
//!   [`stream::crf::ClockReferenceStream`], plus
//!   [`stream::testtone::TestToneStream`], a pseudo audio source.
//! - [`engine`]: the top-level orchestrator tying the above into one
//!   running system.
//! - [`error`]: the crate's error taxonomy.
//! - [`config`]: the dotted-key configuration registry.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use avb_streamhandler::clock::ClockDomain;
//! use avb_streamhandler::engine::{Engine, Environment, LoopbackTransport, NicTransport};
//! use avb_streamhandler::ptp::{PtpProxy, SystemPtpProxy};
//! use avb_streamhandler::stream::audio::CompatibilityMode;
//! use avb_streamhandler::tspec::{SrClass, StreamId, TSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ptp: Arc<dyn PtpProxy> = Arc::new(SystemPtpProxy::new());
//!     let transport: Arc<dyn NicTransport> = Arc::new(LoopbackTransport::new());
//!     let engine = Engine::new(Environment::new(ptp, transport));
//!
//!     let domain_id = engine.create_clock_domain(ClockDomain::new_ptp()).await;
//!     let tspec = TSpec::new(SrClass::High, 24 + 2 * 2 * 6, 1);
//!     let stream_id = engine
//!         .create_transmit_audio_stream(
//!             tspec,
//!             StreamId(0x91E0_F000_FE00_0001),
//!             [0x91, 0xE0, 0xF0, 0x00, 0x0E, 0x80],
//!             [0x00, 0x1b, 0x21, 0x00, 0x00, 0x01],
//!             2,
//!             48_000,
//!             CompatibilityMode::Latest,
//!             domain_id,
//!             4,
//!         )
//!         .await?;
//!     engine.set_stream_active(stream_id, true).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Stream-reservation traffic specifications.
pub mod tspec;

/// The gPTP time-source abstraction.
pub mod ptp;

/// Clock-domain rate recovery and lock-state tracking.
pub mod clock;

/// IEEE 1722 AVTP wire-format encode/decode.
pub mod avtp;

/// The local audio ring buffer and descriptor FIFO.
pub mod localaudio;

/// Audio and clock-reference packet engines.
pub mod stream;

/// The top-level orchestrator.
pub mod engine;

/// Error types and utilities.
pub mod error;

/// The dotted-key configuration registry.
pub mod config;

pub use error::{AvbError, Result};
