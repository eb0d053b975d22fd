//! Protocol seam
//!
//! A driver describes its decoded packet type and how to pull a correlation
//! key (invoke id, transaction id) out of a packet. Everything else about the
//! wire format stays inside the driver's codec.

use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Native integer type of a protocol's correlation identifier
///
/// Values are derived from a 64-bit counter by truncation, so every key type
/// wraps around at its own width (a `u16` goes from `0xFFFF` to `0x0000`).
pub trait CorrelationKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Truncate a counter value to this key width
    fn from_counter(counter: u64) -> Self;
}

macro_rules! impl_correlation_key {
    ($($ty:ty),*) => {
        $(
            impl CorrelationKey for $ty {
                #[inline]
                fn from_counter(counter: u64) -> Self {
                    counter as $ty
                }
            }
        )*
    };
}

impl_correlation_key!(u8, u16, u32, u64);

/// Driver-side description of a wire protocol
///
/// # Example
/// ```ignore
/// impl Protocol for ModbusTcp {
///     type Packet = ModbusTcpAdu;
///     type Key = u16;
///     const NAME: &'static str = "modbus-tcp";
///
///     fn correlation_key(packet: &ModbusTcpAdu) -> Option<u16> {
///         Some(packet.transaction_id)
///     }
/// }
/// ```
pub trait Protocol: Send + Sync + 'static {
    /// Decoded packet exchanged with the codec layer
    type Packet: Clone + Debug + Send + Sync + 'static;

    /// Correlation identifier embedded in requests and responses
    type Key: CorrelationKey;

    /// Protocol name used in logs
    const NAME: &'static str;

    /// Extract the correlation key of a packet
    ///
    /// Protocols without explicit correlation keep the default, which routes
    /// every registration through the ordered expectation registry.
    fn correlation_key(_packet: &Self::Packet) -> Option<Self::Key> {
        None
    }
}

/// Connection-scoped correlation key counter
///
/// The generator does not know which keys are still in flight. With small key
/// spaces a wrapped key can collide with a pending request; bound the number of
/// concurrent requests (see `RequestTransactionManager`) to stay clear of that.
#[derive(Debug)]
pub struct KeyGenerator<K> {
    counter: AtomicU64,
    _marker: PhantomData<fn() -> K>,
}

impl<K: CorrelationKey> KeyGenerator<K> {
    /// Create a generator whose first key is `initial` (truncated to `K`)
    pub fn new(initial: u64) -> Self {
        Self {
            counter: AtomicU64::new(initial),
            _marker: PhantomData,
        }
    }

    /// Return the next key and advance the counter
    pub fn next_key(&self) -> K {
        K::from_counter(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Key the next call to [`next_key`](Self::next_key) will return
    pub fn peek(&self) -> K {
        K::from_counter(self.counter.load(Ordering::Relaxed))
    }
}

impl<K: CorrelationKey> Default for KeyGenerator<K> {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_increase_monotonically() {
        let keys = KeyGenerator::<u32>::new(10);
        assert_eq!(keys.next_key(), 10);
        assert_eq!(keys.next_key(), 11);
        assert_eq!(keys.peek(), 12);
    }

    #[test]
    fn test_u16_wraps_at_native_width() {
        let keys = KeyGenerator::<u16>::new(0xFFFE);
        assert_eq!(keys.next_key(), 0xFFFE);
        assert_eq!(keys.next_key(), 0xFFFF);
        assert_eq!(keys.next_key(), 0x0000);
        assert_eq!(keys.next_key(), 0x0001);
    }

    #[test]
    fn test_u8_wraps_at_native_width() {
        let keys = KeyGenerator::<u8>::new(255);
        assert_eq!(keys.next_key(), 255);
        assert_eq!(keys.next_key(), 0);
    }

    #[test]
    fn test_concurrent_keys_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let keys = Arc::new(KeyGenerator::<u32>::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let keys = Arc::clone(&keys);
                std::thread::spawn(move || (0..250).map(|_| keys.next_key()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key), "duplicate key {}", key);
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
