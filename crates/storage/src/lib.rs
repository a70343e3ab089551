use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    DisplayId, DisplayStatus, EffectId, GroupId, OverrideId, PresentationId, SlideId, TicketId,
    UNKNOWN_IP,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredDisplay {
    pub display_id: DisplayId,
    pub name: String,
    pub manual: bool,
    pub do_overrides: bool,
    pub live: bool,
    pub presentation_id: Option<PresentationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: StoredDisplayState,
}

#[derive(Debug, Clone)]
pub struct StoredDisplayState {
    pub status: DisplayStatus,
    pub current_group_id: Option<i64>,
    pub current_slide_id: Option<i64>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub last_hello: Option<DateTime<Utc>>,
    pub ip: String,
    pub monitor: bool,
    pub websocket_connection_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredSlide {
    pub slide_id: SlideId,
    pub group_id: Option<GroupId>,
    pub name: String,
    pub duration: i64,
    pub effect_id: Option<EffectId>,
    pub position: i64,
    pub public: bool,
}

#[derive(Debug, Clone)]
pub struct StoredPresentation {
    pub presentation_id: PresentationId,
    pub name: String,
    pub effect_id: EffectId,
    pub delay: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_groups: i64,
}

#[derive(Debug, Clone)]
pub struct StoredOverride {
    pub override_id: OverrideId,
    pub display_id: DisplayId,
    pub position: i64,
    pub slide_id: SlideId,
    pub duration: i64,
    pub effect_id: EffectId,
}

#[derive(Debug, Clone)]
pub struct StoredTicket {
    pub ticket_id: TicketId,
    pub display_id: DisplayId,
    pub open: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const DISPLAY_COLUMNS: &str = "d.id, d.name, d.manual, d.do_overrides, d.live, d.presentation_id, \
     d.created_at, d.updated_at, \
     s.status, s.current_group_id, s.current_slide_id, s.last_contact_at, s.last_hello, \
     s.ip, s.monitor, s.websocket_connection_id, s.updated_at";

fn display_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredDisplay {
    StoredDisplay {
        display_id: DisplayId(row.get::<i64, _>(0)),
        name: row.get::<String, _>(1),
        manual: row.get::<bool, _>(2),
        do_overrides: row.get::<bool, _>(3),
        live: row.get::<bool, _>(4),
        presentation_id: row.get::<Option<i64>, _>(5).map(PresentationId),
        created_at: row.get::<DateTime<Utc>, _>(6),
        updated_at: row.get::<DateTime<Utc>, _>(7),
        state: StoredDisplayState {
            status: DisplayStatus::parse(&row.get::<String, _>(8)),
            current_group_id: row.get::<Option<i64>, _>(9),
            current_slide_id: row.get::<Option<i64>, _>(10),
            last_contact_at: row.get::<Option<DateTime<Utc>>, _>(11),
            last_hello: row.get::<Option<DateTime<Utc>>, _>(12),
            ip: row.get::<String, _>(13),
            monitor: row.get::<bool, _>(14),
            websocket_connection_id: row.get::<Option<String>, _>(15),
            updated_at: row.get::<DateTime<Utc>, _>(16),
        },
    }
}

fn override_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredOverride {
    StoredOverride {
        override_id: OverrideId(row.get::<i64, _>(0)),
        display_id: DisplayId(row.get::<i64, _>(1)),
        position: row.get::<i64, _>(2),
        slide_id: SlideId(row.get::<i64, _>(3)),
        duration: row.get::<i64, _>(4),
        effect_id: EffectId(row.get::<i64, _>(5)),
    }
}

fn slide_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredSlide {
    StoredSlide {
        slide_id: SlideId(row.get::<i64, _>(0)),
        group_id: row.get::<Option<i64>, _>(1).map(GroupId),
        name: row.get::<String, _>(2),
        duration: row.get::<i64, _>(3),
        effect_id: row.get::<Option<i64>, _>(4).map(EffectId),
        position: row.get::<i64, _>(5),
        public: row.get::<bool, _>(6),
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        // WAL keeps concurrent writers serializing through the busy handler
        // instead of deadlocking on a shared-lock upgrade.
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // ---- content (effects, presentations, groups, slides) ----

    pub async fn create_effect(&self, name: &str) -> Result<EffectId> {
        let rec = sqlx::query("INSERT INTO effects (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(EffectId(rec.get::<i64, _>(0)))
    }

    /// The globally-configured fallback effect: the lowest-id one.
    pub async fn default_effect(&self) -> Result<Option<EffectId>> {
        let row = sqlx::query("SELECT id FROM effects ORDER BY id ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| EffectId(r.get::<i64, _>(0))))
    }

    pub async fn effect_exists(&self, effect_id: EffectId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM effects WHERE id = ?")
            .bind(effect_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn create_presentation(
        &self,
        name: &str,
        effect_id: EffectId,
        delay: i64,
        now: DateTime<Utc>,
    ) -> Result<PresentationId> {
        let rec = sqlx::query(
            "INSERT INTO presentations (name, effect_id, delay, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(effect_id.0)
        .bind(delay)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(PresentationId(rec.get::<i64, _>(0)))
    }

    pub async fn load_presentation(
        &self,
        presentation_id: PresentationId,
    ) -> Result<Option<StoredPresentation>> {
        let row = sqlx::query(
            "SELECT p.id, p.name, p.effect_id, p.delay, p.created_at, p.updated_at,
                    (SELECT COUNT(*) FROM groups g WHERE g.presentation_id = p.id)
             FROM presentations p WHERE p.id = ?",
        )
        .bind(presentation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredPresentation {
            presentation_id: PresentationId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            effect_id: EffectId(r.get::<i64, _>(2)),
            delay: r.get::<i64, _>(3),
            created_at: r.get::<DateTime<Utc>, _>(4),
            updated_at: r.get::<DateTime<Utc>, _>(5),
            total_groups: r.get::<i64, _>(6),
        }))
    }

    pub async fn create_group(
        &self,
        presentation_id: PresentationId,
        name: &str,
    ) -> Result<GroupId> {
        let rec = sqlx::query(
            "INSERT INTO groups (presentation_id, name, position)
             VALUES (?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM groups WHERE presentation_id = ?))
             RETURNING id",
        )
        .bind(presentation_id.0)
        .bind(name)
        .bind(presentation_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(GroupId(rec.get::<i64, _>(0)))
    }

    pub async fn create_slide(
        &self,
        group_id: Option<GroupId>,
        name: &str,
        duration: i64,
    ) -> Result<SlideId> {
        let rec = sqlx::query(
            "INSERT INTO slides (group_id, name, duration, position)
             VALUES (?, ?, ?,
                     (SELECT COALESCE(MAX(position), 0) + 1 FROM slides WHERE group_id IS ?))
             RETURNING id",
        )
        .bind(group_id.map(|g| g.0))
        .bind(name)
        .bind(duration)
        .bind(group_id.map(|g| g.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(SlideId(rec.get::<i64, _>(0)))
    }

    /// Looks a slide up in the global pool, ignoring group membership.
    /// Override content may reference any slide.
    pub async fn find_slide(&self, slide_id: SlideId) -> Result<Option<StoredSlide>> {
        let row = sqlx::query(
            "SELECT id, group_id, name, duration, effect_id, position, public
             FROM slides WHERE id = ?",
        )
        .bind(slide_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| slide_from_row(&r)))
    }

    /// Resolves a slide inside one group of one presentation. Returns `None`
    /// when the group is not part of the presentation or the slide is not in
    /// the group.
    pub async fn find_slide_in_presentation_group(
        &self,
        presentation_id: PresentationId,
        group_id: GroupId,
        slide_id: SlideId,
    ) -> Result<Option<StoredSlide>> {
        let row = sqlx::query(
            "SELECT s.id, s.group_id, s.name, s.duration, s.effect_id, s.position, s.public
             FROM slides s
             INNER JOIN groups g ON g.id = s.group_id
             WHERE s.id = ? AND g.id = ? AND g.presentation_id = ?",
        )
        .bind(slide_id.0)
        .bind(group_id.0)
        .bind(presentation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| slide_from_row(&r)))
    }

    /// All public slides of a presentation in playback order (group position,
    /// then slide position).
    pub async fn presentation_slides(
        &self,
        presentation_id: PresentationId,
    ) -> Result<Vec<StoredSlide>> {
        let rows = sqlx::query(
            "SELECT s.id, s.group_id, s.name, s.duration, s.effect_id, s.position, s.public
             FROM slides s
             INNER JOIN groups g ON g.id = s.group_id
             WHERE g.presentation_id = ? AND s.public = 1
             ORDER BY g.position, s.position",
        )
        .bind(presentation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(slide_from_row).collect())
    }

    // ---- displays ----

    /// Find-or-create by name; the display state row is created in the same
    /// transaction so a display never exists without one. Returns the row
    /// and whether it was created by this call. Two concurrent first calls
    /// for one name land on the conflict clause, so exactly one creates.
    pub async fn find_or_create_display(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(StoredDisplay, bool)> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            "INSERT INTO displays (name, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let display_id = sqlx::query("SELECT id FROM displays WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?
            .get::<i64, _>(0);

        if created {
            sqlx::query("INSERT INTO display_states (display_id, updated_at) VALUES (?, ?)")
                .bind(display_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let display = self
            .load_display(DisplayId(display_id))
            .await?
            .context("display row vanished after find_or_create")?;
        Ok((display, created))
    }

    pub async fn load_display(&self, display_id: DisplayId) -> Result<Option<StoredDisplay>> {
        let row = sqlx::query(&format!(
            "SELECT {DISPLAY_COLUMNS} FROM displays d
             INNER JOIN display_states s ON s.display_id = d.id
             WHERE d.id = ?"
        ))
        .bind(display_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| display_from_row(&r)))
    }

    pub async fn load_display_by_name(&self, name: &str) -> Result<Option<StoredDisplay>> {
        let row = sqlx::query(&format!(
            "SELECT {DISPLAY_COLUMNS} FROM displays d
             INNER JOIN display_states s ON s.display_id = d.id
             WHERE d.name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| display_from_row(&r)))
    }

    /// The display currently bound to a websocket connection id, through the
    /// connection index.
    pub async fn load_display_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<StoredDisplay>> {
        let row = sqlx::query(&format!(
            "SELECT {DISPLAY_COLUMNS} FROM displays d
             INNER JOIN display_states s ON s.display_id = d.id
             WHERE s.websocket_connection_id = ?"
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| display_from_row(&r)))
    }

    pub async fn list_displays(&self) -> Result<Vec<StoredDisplay>> {
        let rows = sqlx::query(&format!(
            "SELECT {DISPLAY_COLUMNS} FROM displays d
             INNER JOIN display_states s ON s.display_id = d.id
             ORDER BY lower(d.name) ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(display_from_row).collect())
    }

    pub async fn assign_presentation(
        &self,
        display_id: DisplayId,
        presentation_id: Option<PresentationId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE displays SET presentation_id = ?, updated_at = ? WHERE id = ?")
            .bind(presentation_id.map(|p| p.0))
            .bind(now)
            .bind(display_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Manual control disables override acceptance in the same statement.
    pub async fn set_manual(
        &self,
        display_id: DisplayId,
        manual: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE displays
             SET manual = ?, do_overrides = CASE WHEN ? THEN 0 ELSE do_overrides END, updated_at = ?
             WHERE id = ?",
        )
        .bind(manual)
        .bind(manual)
        .bind(now)
        .bind(display_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_monitor(
        &self,
        display_id: DisplayId,
        monitor: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE display_states SET monitor = ?, updated_at = ? WHERE display_id = ?")
            .bind(monitor)
            .bind(now)
            .bind(display_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_live(&self, display_id: DisplayId, live: bool, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE displays SET live = ?, updated_at = ? WHERE id = ?")
            .bind(live)
            .bind(now)
            .bind(display_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Row-scoped state refresh for a hello handshake: ip, connection id,
    /// contact timestamps, and a forced `running` status in one statement.
    pub async fn record_hello(
        &self,
        display_id: DisplayId,
        ip: Option<&str>,
        connection_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ip = match ip.map(str::trim) {
            Some(value) if !value.is_empty() => value,
            _ => UNKNOWN_IP,
        };
        sqlx::query(
            "UPDATE display_states
             SET ip = ?, websocket_connection_id = ?, last_contact_at = ?, last_hello = ?,
                 status = 'running', updated_at = ?
             WHERE display_id = ?",
        )
        .bind(ip)
        .bind(connection_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(display_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Commits a successful playback position update together with its shown
    /// audit row. All-or-nothing: a failure leaves the prior pointers intact.
    pub async fn commit_playback_position(
        &self,
        display_id: DisplayId,
        current_group_id: i64,
        slide_id: SlideId,
        connection_id: Option<&str>,
        live: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE display_states
             SET current_group_id = ?, current_slide_id = ?, websocket_connection_id = ?,
                 last_contact_at = ?, status = 'running', updated_at = ?
             WHERE display_id = ?",
        )
        .bind(current_group_id)
        .bind(slide_id.0)
        .bind(connection_id)
        .bind(now)
        .bind(now)
        .bind(display_id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO shown_slides (display_id, slide_id, live, shown_at) VALUES (?, ?, ?, ?)")
            .bind(display_id.0)
            .bind(slide_id.0)
            .bind(live)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomic check-and-delete consumption of one override entry. The entry
    /// delete, position renumbering, state update, and shown audit commit as
    /// one transaction; a concurrent consumer of the same id sees `None`.
    pub async fn consume_override(
        &self,
        display_id: DisplayId,
        override_id: OverrideId,
        connection_id: Option<&str>,
        live: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredOverride>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "DELETE FROM override_queues WHERE id = ? AND display_id = ?
             RETURNING id, display_id, position, slide_id, duration, effect_id",
        )
        .bind(override_id.0)
        .bind(display_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let entry = override_from_row(&row);

        renumber_overrides(&mut tx, display_id).await?;
        sqlx::query(
            "UPDATE display_states
             SET current_group_id = ?, current_slide_id = ?, websocket_connection_id = ?,
                 last_contact_at = ?, status = 'running', updated_at = ?
             WHERE display_id = ?",
        )
        .bind(shared::domain::OVERRIDE_GROUP_ID)
        .bind(entry.slide_id.0)
        .bind(connection_id)
        .bind(now)
        .bind(now)
        .bind(display_id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO shown_slides (display_id, slide_id, live, shown_at) VALUES (?, ?, ?, ?)")
            .bind(display_id.0)
            .bind(entry.slide_id.0)
            .bind(live)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    /// Marks the display holding this connection id as disconnected. Unknown
    /// or already-reassigned connection ids are a no-op.
    pub async fn mark_disconnected(
        &self,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredDisplay>> {
        let row = sqlx::query(
            "UPDATE display_states
             SET status = 'disconnected', websocket_connection_id = NULL, updated_at = ?
             WHERE websocket_connection_id = ?
             RETURNING display_id",
        )
        .bind(now)
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => self.load_display(DisplayId(row.get::<i64, _>(0))).await,
            None => Ok(None),
        }
    }

    // ---- override queue ----

    pub async fn append_override(
        &self,
        display_id: DisplayId,
        slide_id: SlideId,
        duration: i64,
        effect_id: EffectId,
    ) -> Result<StoredOverride> {
        let row = sqlx::query(
            "INSERT INTO override_queues (display_id, position, slide_id, duration, effect_id)
             VALUES (?, (SELECT COALESCE(MAX(position), 0) + 1 FROM override_queues WHERE display_id = ?), ?, ?, ?)
             RETURNING id, display_id, position, slide_id, duration, effect_id",
        )
        .bind(display_id.0)
        .bind(display_id.0)
        .bind(slide_id.0)
        .bind(duration)
        .bind(effect_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(override_from_row(&row))
    }

    pub async fn list_overrides(&self, display_id: DisplayId) -> Result<Vec<StoredOverride>> {
        let rows = sqlx::query(
            "SELECT id, display_id, position, slide_id, duration, effect_id
             FROM override_queues WHERE display_id = ? ORDER BY position ASC",
        )
        .bind(display_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(override_from_row).collect())
    }

    pub async fn remove_override(
        &self,
        display_id: DisplayId,
        override_id: OverrideId,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM override_queues WHERE id = ? AND display_id = ?")
            .bind(override_id.0)
            .bind(display_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed > 0 {
            renumber_overrides(&mut tx, display_id).await?;
        }
        tx.commit().await?;
        Ok(removed > 0)
    }

    pub async fn clear_overrides(&self, display_id: DisplayId) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM override_queues WHERE display_id = ?")
            .bind(display_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    // ---- error tickets ----

    /// Appends a line to the open ticket, opening one when none exists, and
    /// forces the display into error status with a refreshed contact time.
    /// At most one open ticket per display at any time.
    pub async fn append_error(
        &self,
        display_id: DisplayId,
        line: &str,
        now: DateTime<Utc>,
    ) -> Result<TicketId> {
        let mut tx = self.pool.begin().await?;
        let open = sqlx::query(
            "SELECT id FROM error_tickets WHERE display_id = ? AND open = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(display_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let ticket_id = match open {
            Some(row) => {
                let id = row.get::<i64, _>(0);
                sqlx::query(
                    "UPDATE error_tickets SET description = description || char(10) || ?, updated_at = ? WHERE id = ?",
                )
                .bind(line)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let rec = sqlx::query(
                    "INSERT INTO error_tickets (display_id, open, description, created_at, updated_at)
                     VALUES (?, 1, ?, ?, ?) RETURNING id",
                )
                .bind(display_id.0)
                .bind(line)
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                rec.get::<i64, _>(0)
            }
        };

        sqlx::query(
            "UPDATE display_states SET status = 'error', last_contact_at = ?, updated_at = ?
             WHERE display_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(display_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TicketId(ticket_id))
    }

    pub async fn open_ticket(&self, display_id: DisplayId) -> Result<Option<StoredTicket>> {
        let row = sqlx::query(
            "SELECT id, display_id, open, description, created_at, updated_at
             FROM error_tickets WHERE display_id = ? AND open = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(display_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredTicket {
            ticket_id: TicketId(r.get::<i64, _>(0)),
            display_id: DisplayId(r.get::<i64, _>(1)),
            open: r.get::<bool, _>(2),
            description: r.get::<String, _>(3),
            created_at: r.get::<DateTime<Utc>, _>(4),
            updated_at: r.get::<DateTime<Utc>, _>(5),
        }))
    }

    pub async fn ticket_count(&self, display_id: DisplayId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM error_tickets WHERE display_id = ?")
            .bind(display_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Closes a ticket. Closed tickets are retained for history and the
    /// display status is left alone; only a successful client event clears it.
    /// Closes one open ticket. Scoped to the owning display so a ticket id
    /// routed under the wrong display cannot close someone else's ticket.
    pub async fn close_ticket(
        &self,
        display_id: DisplayId,
        ticket_id: TicketId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE error_tickets SET open = 0, updated_at = ?
             WHERE id = ? AND display_id = ? AND open = 1",
        )
        .bind(now)
        .bind(ticket_id.0)
        .bind(display_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    // ---- liveness / audit ----

    /// One indexed pass over monitored displays with a contact older than
    /// the cutoff. Displays that never reported are not late.
    pub async fn late_displays(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredDisplay>> {
        let rows = sqlx::query(&format!(
            "SELECT {DISPLAY_COLUMNS} FROM displays d
             INNER JOIN display_states s ON s.display_id = d.id
             WHERE s.monitor = 1 AND s.last_contact_at IS NOT NULL AND s.last_contact_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(display_from_row).collect())
    }

    pub async fn shown_count(&self, display_id: DisplayId, slide_id: SlideId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM shown_slides WHERE display_id = ? AND slide_id = ?",
        )
        .bind(display_id.0)
        .bind(slide_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Renumbers a display's remaining queue positions contiguously from 1,
/// preserving relative order. Runs inside the caller's transaction.
async fn renumber_overrides(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    display_id: DisplayId,
) -> Result<()> {
    sqlx::query(
        "UPDATE override_queues
         SET position = (SELECT COUNT(*) FROM override_queues o2
                         WHERE o2.display_id = override_queues.display_id
                           AND (o2.position < override_queues.position
                                OR (o2.position = override_queues.position AND o2.id < override_queues.id))) + 1
         WHERE display_id = ?",
    )
    .bind(display_id.0)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
