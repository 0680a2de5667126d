//! Core of the pgward watchdog: a single-threaded poll reactor driving the
//! cluster coordination state machine over a full mesh of watchdog peers.
#![allow(clippy::type_complexity)]

pub mod client;
pub mod fsm;
pub mod net;
