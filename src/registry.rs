//! Process-wide multiplexer registry
//!
//! Connections and listeners bound to the same local endpoint must share
//! one UDP socket. The registry maps local endpoints to their multiplexers,
//! holding weak references so an endpoint with no remaining connections is
//! collected; dead entries are pruned on lookup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::multiplexer::Multiplexer;

fn registry() -> &'static Mutex<HashMap<SocketAddr, Weak<Multiplexer>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<SocketAddr, Weak<Multiplexer>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Share the live multiplexer for an explicit local endpoint, or bind a
/// fresh one. Port zero always binds fresh and registers the resolved
/// address.
pub(crate) async fn bind(addr: SocketAddr) -> Result<Arc<Multiplexer>> {
    if addr.port() != 0 {
        let mut map = registry().lock();
        map.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = map.get(&addr).and_then(Weak::upgrade) {
            return Ok(existing);
        }
    }

    // The UDP bind happens outside the lock; two races for the same
    // explicit endpoint are settled by the OS, the loser sees AddrInUse.
    let mux = Multiplexer::bind(addr).await?;
    registry().lock().insert(mux.local_addr(), Arc::downgrade(&mux));
    Ok(mux)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_zero_binds_are_distinct() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = bind(addr).await.unwrap();
        let b = bind(addr).await.unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn test_explicit_endpoint_is_shared() {
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr();

        let second = bind(addr).await.unwrap();
        assert_eq!(second.local_addr(), addr);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_dead_entry_is_pruned() {
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr();
        drop(first);
        // The aborted receive task must release the socket before rebinding.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The old multiplexer is gone; a new bind of the endpoint works.
        let again = bind(addr).await.unwrap();
        assert_eq!(again.local_addr(), addr);
    }
}
