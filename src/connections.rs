//! A bounded pool of connection slots, serialized by a single table
//! mutex.
//!
//! Slots are reserved before a peer is accepted, bound to an
//! established [`ConnectionState`] once its handshake completes, and
//! reset when the connection ends. Instance ids are drawn from a
//! monotonic counter and never reused while the previous holder is
//! active; wraparound skips live ids.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::ConnectionState;

/// A shared handle onto one bound connection; the inner mutex is the
/// per-slot serialization point for concurrent senders.
pub(crate) type ConnectionHandle = Arc<Mutex<ConnectionState>>;

struct Slot {
    conn: Option<ConnectionHandle>,
    active: bool,
    instance: u32,
}

impl Slot {
    const fn free() -> Self {
        Self {
            conn: None,
            active: false,
            instance: 0,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    counter: u32,
}

/// The connection pool, sized `[init, max]`.
pub(crate) struct ConnectionTable {
    inner: Mutex<Inner>,
    init: usize,
    max: usize,
}

impl ConnectionTable {
    pub fn new(init: usize, max: usize) -> Self {
        let mut slots = Vec::with_capacity(init);
        slots.resize_with(init, Slot::free);

        Self {
            inner: Mutex::new(Inner { slots, counter: 1 }),
            init,
            max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("The connection table lock has been poisonned")
    }

    /// Repopulate the pool to its initial size, e.g. after a dispose.
    pub fn initialize(&self) {
        let mut inner = self.lock();

        inner.slots.clear();
        inner.slots.resize_with(self.init, Slot::free);
    }

    /// Atomically reserve a free slot under a fresh instance id, `None`
    /// once `max` slots are live.
    pub fn next(&self) -> Option<u32> {
        let mut inner = self.lock();

        let index = match inner.slots.iter().position(|slot| !slot.active) {
            Some(index) => index,
            None if inner.slots.len() < self.max => {
                inner.slots.push(Slot::free());

                inner.slots.len() - 1
            }
            None => return None,
        };

        let instance = fresh_instance(&mut inner);
        let slot = &mut inner.slots[index];

        slot.active = true;
        slot.instance = instance;
        slot.conn = None;

        Some(instance)
    }

    /// Attach an established connection to its reserved slot, handing
    /// back the shared handle; `None` when the reservation was reset in
    /// the meanwhile.
    pub fn bind(&self, instance: u32, state: ConnectionState) -> Option<ConnectionHandle> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|slot| slot.active && slot.instance == instance)?;

        let conn = Arc::new(Mutex::new(state));
        slot.conn = Some(Arc::clone(&conn));

        Some(conn)
    }

    /// The bound connection at `index`, `None` for free or out-of-range
    /// slots.
    pub fn index(&self, index: usize) -> Option<ConnectionHandle> {
        self.lock()
            .slots
            .get(index)
            .filter(|slot| slot.active)
            .and_then(|slot| slot.conn.clone())
    }

    /// Whether the slot at `index` is reserved or bound.
    pub fn active(&self, index: usize) -> bool {
        self.lock()
            .slots
            .get(index)
            .map(|slot| slot.active)
            .unwrap_or_default()
    }

    /// Free the slot holding `instance`; the connection state is wiped
    /// when its last handle releases.
    pub fn reset(&self, instance: u32) {
        let mut inner = self.lock();

        if let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|slot| slot.active && slot.instance == instance)
        {
            slot.conn = None;
            slot.instance = 0;
            slot.active = false;
        }
    }

    /// Snapshot the bound connections, for iteration outside the table
    /// lock.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.active)
            .filter_map(|slot| slot.conn.clone())
            .collect()
    }

    /// Snapshot the live instance ids.
    pub fn instances(&self) -> Vec<u32> {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.active)
            .map(|slot| slot.instance)
            .collect()
    }

    /// The current number of slots, free ones included.
    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    /// Drop every slot.
    pub fn dispose(&self) {
        self.lock().slots.clear();
    }
}

/// The next unused instance id; zero is reserved for "no instance".
fn fresh_instance(inner: &mut Inner) -> u32 {
    loop {
        let id = inner.counter;
        inner.counter = inner.counter.wrapping_add(1);

        if id != 0
            && !inner
                .slots
                .iter()
                .any(|slot| slot.active && slot.instance == id)
        {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::{TcpListener, TcpStream};

    use super::*;

    #[test]
    fn it_reserves_up_to_its_bound() {
        let table = ConnectionTable::new(2, 4);

        let reservations: Vec<_> = (0..4).map(|_| table.next()).collect();
        assert!(reservations.iter().all(Option::is_some));
        assert!(table.next().is_none());
        assert_eq!(table.size(), 4);

        table.reset(reservations[2].expect("reservation missing"));
        assert!(table.next().is_some());
        assert_eq!(table.size(), 4);
    }

    #[test]
    fn instances_are_never_reused() {
        let table = ConnectionTable::new(2, 2);
        let mut seen = HashSet::new();

        for _ in 0..64 {
            let instance = table.next().expect("reservation failed");
            assert!(seen.insert(instance), "instance {instance} repeated");
            table.reset(instance);
        }
    }

    #[test]
    fn a_reset_slot_is_observed_inactive() {
        let table = ConnectionTable::new(1, 1);

        let instance = table.next().expect("reservation failed");
        assert!(table.active(0));

        table.reset(instance);
        assert!(!table.active(0));
        assert!(table.index(0).is_none());

        // Resetting a stale instance is a quiet no-op.
        table.reset(instance);
        assert!(!table.active(0));
    }

    #[test]
    fn it_binds_and_hands_out_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let address = listener.local_addr().expect("no local address");
        let _near = TcpStream::connect(address).expect("connect failed");
        let (far, _) = listener.accept().expect("accept failed");

        let table = ConnectionTable::new(1, 1);
        let instance = table.next().expect("reservation failed");

        let state = ConnectionState::new(far, instance).expect("state failed");
        let handle = table.bind(instance, state).expect("bind failed");

        assert_eq!(table.handles().len(), 1);
        assert_eq!(
            table
                .index(0)
                .expect("no bound slot")
                .lock()
                .expect("connection lock poisonned")
                .instance(),
            instance,
        );

        table.reset(instance);
        assert!(table.handles().is_empty());
        assert_eq!(handle.lock().expect("connection lock poisonned").instance(), instance);
    }

    #[test]
    fn concurrent_churn_upholds_the_bounds() {
        let table = Arc::new(ConnectionTable::new(4, 32));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let seen = Arc::clone(&seen);

                std::thread::spawn(move || {
                    for _ in 0..256 {
                        let Some(instance) = table.next() else {
                            continue;
                        };

                        assert!(
                            seen.lock().expect("set lock poisonned").insert(instance),
                            "instance {instance} repeated",
                        );
                        assert!(table.size() <= 32);

                        table.reset(instance);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker panicked");
        }

        assert!(table.instances().is_empty());
        assert!(table.size() <= 32);
    }

    #[test]
    fn dispose_then_initialize_restores_the_pool() {
        let table = ConnectionTable::new(2, 4);
        let _ = table.next();

        table.dispose();
        assert_eq!(table.size(), 0);
        assert!(table.next().is_some());

        table.initialize();
        assert_eq!(table.size(), 2);
        assert!(table.instances().is_empty());
    }
}
