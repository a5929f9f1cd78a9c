use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::repository::{BookingRepository, Roster, StoreError};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Each wake-up drains every append already queued and commits
/// them with a single fsync before answering any of them.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes do not leak into
    // the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Rooms, roster and bookings held in memory and made durable through the WAL.
pub struct Store {
    rooms: DashMap<Ulid, Room>,
    classes: DashMap<Ulid, Class>,
    users: DashMap<Ulid, User>,
    bookings: DashMap<Ulid, Booking>,
    /// Room id → ids of its bookings.
    by_room: DashMap<Ulid, Vec<Ulid>>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared from append to apply; compaction holds it
    /// exclusively so its snapshot covers every durable event.
    write_gate: RwLock<()>,
}

impl Store {
    /// Replay the log at `path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            rooms: DashMap::new(),
            classes: DashMap::new(),
            users: DashMap::new(),
            bookings: DashMap::new(),
            by_room: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
        };
        for event in &events {
            store.apply(event);
        }
        tracing::info!(
            "store replayed {} events: {} rooms, {} bookings",
            events.len(),
            store.rooms.len(),
            store.bookings.len()
        );
        Ok(store)
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => {
                self.rooms.insert(room.id, room.clone());
            }
            Event::ClassCreated { class } => {
                self.classes.insert(class.id, class.clone());
            }
            Event::UserRegistered { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::BookingCreated { booking } => {
                self.by_room.entry(booking.room_id).or_default().push(booking.id);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingDeleted { id, room_id } => {
                self.bookings.remove(id);
                if let Some(mut ids) = self.by_room.get_mut(room_id) {
                    ids.retain(|b| b != id);
                }
            }
        }
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| StoreError::WriterGone("WAL writer shut down"))?;
        rx.await
            .map_err(|_| StoreError::WriterGone("WAL writer dropped response"))??;
        Ok(())
    }

    async fn persist_and_apply(&self, event: Event) -> Result<(), StoreError> {
        let _writing = self.write_gate.read().await;
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    pub async fn insert_class(&self, class: Class) -> Result<Class, StoreError> {
        if self.classes.contains_key(&class.id) {
            return Err(StoreError::AlreadyExists(class.id));
        }
        self.persist_and_apply(Event::ClassCreated { class: class.clone() }).await?;
        Ok(class)
    }

    pub async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        if self.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists(user.id));
        }
        self.persist_and_apply(Event::UserRegistered { user: user.clone() }).await?;
        Ok(user)
    }

    /// Rewrite the log with just the events that recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.write_gate.write().await;
        let mut events: Vec<Event> = Vec::new();
        events.extend(self.rooms.iter().map(|r| Event::RoomCreated { room: r.value().clone() }));
        events.extend(self.classes.iter().map(|c| Event::ClassCreated { class: c.value().clone() }));
        events.extend(self.users.iter().map(|u| Event::UserRegistered { user: u.value().clone() }));
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        sort_by_start(&mut bookings);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WriterGone("WAL writer shut down"))?;
        rx.await
            .map_err(|_| StoreError::WriterGone("WAL writer dropped response"))??;
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Order by parsed start; rows with a malformed start sort first, ties by id.
fn sort_by_start(bookings: &mut [Booking]) {
    bookings.sort_by_cached_key(|b| (b.start(), b.id));
}

#[async_trait]
impl BookingRepository for Store {
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rooms)
    }

    async fn get_room(&self, id: Ulid) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(&id).map(|r| r.value().clone()))
    }

    async fn insert_room(&self, room: Room) -> Result<Room, StoreError> {
        if self.rooms.contains_key(&room.id) {
            return Err(StoreError::AlreadyExists(room.id));
        }
        self.persist_and_apply(Event::RoomCreated { room: room.clone() }).await?;
        Ok(room)
    }

    async fn update_room(&self, room: Room) -> Result<Room, StoreError> {
        if !self.rooms.contains_key(&room.id) {
            return Err(StoreError::NotFound(room.id));
        }
        self.persist_and_apply(Event::RoomUpdated { room: room.clone() }).await?;
        Ok(room)
    }

    async fn list_by_room(&self, room_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .by_room
            .get(&room_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings: Vec<Booking> = ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect();
        sort_by_start(&mut bookings);
        Ok(bookings)
    }

    async fn list_all(&self) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        sort_by_start(&mut bookings);
        Ok(bookings)
    }

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError> {
        if !self.rooms.contains_key(&booking.room_id) {
            return Err(StoreError::UnknownRoom(booking.room_id));
        }
        if self.bookings.contains_key(&booking.id) {
            return Err(StoreError::AlreadyExists(booking.id));
        }
        self.persist_and_apply(Event::BookingCreated { booking: booking.clone() }).await?;
        Ok(booking)
    }

    async fn delete_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        let Some(booking) = self.bookings.get(&id).map(|b| b.value().clone()) else {
            return Ok(None);
        };
        self.persist_and_apply(Event::BookingDeleted { id, room_id: booking.room_id })
            .await?;
        Ok(Some(booking))
    }
}

#[async_trait]
impl Roster for Store {
    async fn students_of(&self, class_id: Ulid) -> Result<Vec<Ulid>, StoreError> {
        let mut ids: Vec<Ulid> = self
            .users
            .iter()
            .filter(|u| u.class_id == Some(class_id))
            .map(|u| u.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn user_name(&self, user_id: Ulid) -> Result<Option<String>, StoreError> {
        Ok(self.users.get(&user_id).map(|u| u.name.clone()))
    }

    async fn class_name(&self, class_id: Ulid) -> Result<Option<String>, StoreError> {
        Ok(self.classes.get(&class_id).map(|c| c.name.clone()))
    }
}
