//! Boundary to the binlog replication client.
//!
//! The wire-protocol client itself is external. It is driven through [`BinlogSource`] and
//! reports decoded events to a [`BinlogHandler`]. [`StreamEventHandler`] is the handler every
//! pipeline installs: it binds rows to their rule and forwards rows and position markers to the
//! flush loop through an [`EventSink`].

mod base;
mod handler;

pub use base::{BinlogHandler, BinlogSource};
pub use handler::{ChannelSink, EventSink, Message, MessageKind, StreamEventHandler};
