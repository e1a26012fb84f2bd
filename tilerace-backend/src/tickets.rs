//! Session tickets: a read-through cache in front of the tickets table.
//!
//! Absence from the cache never implies absence from the store. Writers
//! (create, revoke and the miss path that fills the cache) take the same
//! gate, so a revoked ticket cannot be put back into the cache by a lookup
//! that raced with the revocation.

use crate::helpers::{generate_ticket_id, now};
use tilerace_db::{Database, Ticket};
use tokio::sync::Mutex;

pub struct TicketStore {
    db: Database,
    cache: scc::HashMap<String, Ticket>,
    write_gate: Mutex<()>,
}

impl TicketStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: scc::HashMap::new(),
            write_gate: Mutex::new(()),
        }
    }

    pub async fn resolve(&self, ticket_id: &str) -> tilerace_db::Result<Option<Ticket>> {
        if let Some(ticket) = self.cache.read_async(ticket_id, |_, t| t.clone()).await {
            return Ok(Some(ticket));
        }

        let _gate = self.write_gate.lock().await;
        // Another resolver may have filled the cache while we waited
        if let Some(ticket) = self.cache.read_async(ticket_id, |_, t| t.clone()).await {
            return Ok(Some(ticket));
        }

        let ticket = self.db.get_ticket(ticket_id.to_string()).await?;
        if let Some(ticket) = &ticket {
            let _ = self.cache.insert_async(ticket.id.clone(), ticket.clone()).await;
        }
        Ok(ticket)
    }

    /// Linear scan of the cache, then the store. Fine while the number of
    /// concurrent sessions stays small.
    pub async fn resolve_by_player(&self, player_id: &str) -> tilerace_db::Result<Option<Ticket>> {
        let mut found = None;
        self.cache
            .retain_async(|_, ticket| {
                if found.is_none() && ticket.player_id == player_id {
                    found = Some(ticket.clone());
                }
                true
            })
            .await;

        if found.is_some() {
            return Ok(found);
        }

        let _gate = self.write_gate.lock().await;
        let ticket = self
            .db
            .get_ticket_for_player_id(player_id.to_string())
            .await?;
        if let Some(ticket) = &ticket {
            let _ = self.cache.insert_async(ticket.id.clone(), ticket.clone()).await;
        }
        Ok(ticket)
    }

    pub async fn create(&self, player_id: &str, is_guest: bool) -> tilerace_db::Result<Ticket> {
        let _gate = self.write_gate.lock().await;
        let ticket = self
            .db
            .create_ticket(generate_ticket_id(), player_id.to_string(), is_guest, now())
            .await?;
        let _ = self.cache.insert_async(ticket.id.clone(), ticket.clone()).await;
        tracing::debug!(player_id, "Ticket created");
        Ok(ticket)
    }

    /// Put a ticket that was created by another store operation (guest
    /// registration) into the cache.
    pub async fn remember(&self, ticket: Ticket) {
        let _gate = self.write_gate.lock().await;
        let _ = self.cache.insert_async(ticket.id.clone(), ticket).await;
    }

    pub async fn revoke(&self, ticket_id: &str) -> tilerace_db::Result<()> {
        let _gate = self.write_gate.lock().await;
        self.db.delete_ticket(ticket_id.to_string()).await?;
        let _ = self.cache.remove_async(ticket_id).await;
        Ok(())
    }
}
