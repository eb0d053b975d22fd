//! Shared fixtures for unit tests

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ConversationError, Result};
use crate::protocol::Protocol;
use crate::sink::WireSink;

#[derive(Debug, Clone, PartialEq)]
pub struct TypeA {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeB {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedFrame {
    pub key: u16,
    pub body: TypeA,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestPacket {
    A(TypeA),
    B(TypeB),
    Keyed(KeyedFrame),
}

impl TryFrom<TestPacket> for TypeA {
    type Error = TestPacket;

    fn try_from(packet: TestPacket) -> std::result::Result<Self, Self::Error> {
        match packet {
            TestPacket::A(a) => Ok(a),
            other => Err(other),
        }
    }
}

impl TryFrom<TestPacket> for TypeB {
    type Error = TestPacket;

    fn try_from(packet: TestPacket) -> std::result::Result<Self, Self::Error> {
        match packet {
            TestPacket::B(b) => Ok(b),
            other => Err(other),
        }
    }
}

impl TryFrom<TestPacket> for KeyedFrame {
    type Error = TestPacket;

    fn try_from(packet: TestPacket) -> std::result::Result<Self, Self::Error> {
        match packet {
            TestPacket::Keyed(frame) => Ok(frame),
            other => Err(other),
        }
    }
}

pub fn keyed(key: u16, id: u32) -> TestPacket {
    TestPacket::Keyed(KeyedFrame {
        key,
        body: TypeA { id },
    })
}

/// Protocol without correlation keys; everything goes through the registry
pub struct PlainProtocol;

impl Protocol for PlainProtocol {
    type Packet = TestPacket;
    type Key = u16;
    const NAME: &'static str = "plain";
}

/// Protocol keyed on `KeyedFrame::key`
pub struct KeyedProtocol;

impl Protocol for KeyedProtocol {
    type Packet = TestPacket;
    type Key = u16;
    const NAME: &'static str = "keyed";

    fn correlation_key(packet: &TestPacket) -> Option<u16> {
        match packet {
            TestPacket::Keyed(frame) => Some(frame.key),
            _ => None,
        }
    }
}

/// Sink recording every written packet, optionally failing writes
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<TestPacket>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<TestPacket> {
        self.sent.lock().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

impl WireSink<TestPacket> for RecordingSink {
    fn send_to_wire(&self, packet: TestPacket) -> Result<()> {
        if *self.fail.lock() {
            return Err(ConversationError::io("sink refused write"));
        }
        self.sent.lock().push(packet);
        Ok(())
    }
}
