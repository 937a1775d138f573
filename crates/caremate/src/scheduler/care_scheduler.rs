//! Care Scheduler
//!
//! One loop owns every schedule entry. It sleeps until the earliest pending
//! fire time (never longer than the poll interval), or until an entry is
//! added or re-enabled, or until shutdown. Due entries are advanced before
//! their check-in runs, so a slow firing never holds back the next one and
//! missed firings collapse into a single catch-up.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::trigger::{parse_timezone, TriggerSpec};
use crate::config::Config;
use crate::context_engine::{check_in_instruction_at, ProactiveDelivery, SessionManager};
use crate::error::{CareError, CareResult};
use crate::memory_db::{MemoryDatabase, ScheduleEntry};
use crate::metrics;

const DELIVERY_CHANNEL_CAPACITY: usize = 64;
const MIN_SLEEP: Duration = Duration::from_millis(200);

pub struct CareScheduler {
    db: Arc<MemoryDatabase>,
    sessions: Arc<SessionManager>,
    default_timezone: Tz,
    poll: Duration,
    wake: Notify,
    deliveries: broadcast::Sender<ProactiveDelivery>,
}

impl CareScheduler {
    pub fn new(sessions: Arc<SessionManager>, cfg: &Config) -> CareResult<Self> {
        let default_timezone = parse_timezone(&cfg.scheduler_timezone)
            .map_err(|_| CareError::InvalidConfig(format!("unknown SCHEDULER_TIMEZONE '{}'", cfg.scheduler_timezone)))?;
        let (deliveries, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::clone(sessions.database()),
            sessions,
            default_timezone,
            poll: Duration::from_secs(cfg.scheduler_poll_seconds.max(1)),
            wake: Notify::new(),
            deliveries,
        })
    }

    /// Receives every delivered proactive message.
    pub fn subscribe(&self) -> broadcast::Receiver<ProactiveDelivery> {
        self.deliveries.subscribe()
    }

    pub fn create_schedule(
        &self,
        owner_id: &str,
        trigger_spec: &str,
        timezone: Option<&str>,
    ) -> CareResult<ScheduleEntry> {
        if owner_id.trim().is_empty() {
            return Err(CareError::InvalidInput("owner_id is required".to_string()));
        }
        let spec = TriggerSpec::parse(trigger_spec)?;
        let tz = match timezone {
            Some(name) => parse_timezone(name)?,
            None => self.default_timezone,
        };
        let now = Utc::now();
        let entry = ScheduleEntry {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.trim().to_string(),
            trigger_spec: trigger_spec.trim().to_string(),
            timezone: tz.name().to_string(),
            enabled: true,
            last_fired: None,
            next_fire: spec.next_after(now, &tz)?,
            created_at: now,
        };
        self.db.schedules.insert(&entry)?;
        self.wake.notify_one();
        Ok(entry)
    }

    pub fn list_schedules(&self, owner_id: &str) -> CareResult<Vec<ScheduleEntry>> {
        self.db.schedules.list_for_owner(owner_id)
    }

    /// Disabling leaves next-fire as it was; enabling recomputes it from now.
    pub fn set_enabled(&self, owner_id: &str, id: &str, enabled: bool) -> CareResult<ScheduleEntry> {
        let mut entry = self.owned_entry(owner_id, id)?;
        if entry.enabled == enabled {
            return Ok(entry);
        }
        if enabled {
            let spec = TriggerSpec::parse(&entry.trigger_spec)?;
            let tz = parse_timezone(&entry.timezone)?;
            entry.next_fire = spec.next_after(Utc::now(), &tz)?;
        }
        entry.enabled = enabled;
        self.db.schedules.set_enabled(id, enabled, entry.next_fire)?;
        info!("Schedule {} {}", id, if enabled { "enabled" } else { "disabled" });
        self.wake.notify_one();
        Ok(entry)
    }

    /// Replaces any of trigger, timezone and enabled flag. Next-fire is
    /// recomputed from now whenever the entry ends up enabled.
    pub fn update_schedule(
        &self,
        owner_id: &str,
        id: &str,
        trigger_spec: Option<&str>,
        timezone: Option<&str>,
        enabled: Option<bool>,
    ) -> CareResult<ScheduleEntry> {
        let mut entry = self.owned_entry(owner_id, id)?;
        if let Some(raw) = trigger_spec {
            TriggerSpec::parse(raw)?;
            entry.trigger_spec = raw.trim().to_string();
        }
        if let Some(name) = timezone {
            entry.timezone = parse_timezone(name)?.name().to_string();
        }
        if let Some(enabled) = enabled {
            entry.enabled = enabled;
        }
        if entry.enabled {
            let spec = TriggerSpec::parse(&entry.trigger_spec)?;
            let tz = parse_timezone(&entry.timezone)?;
            entry.next_fire = spec.next_after(Utc::now(), &tz)?;
        }

        self.db.schedules.update(&entry)?;
        info!("Updated schedule {}: '{}' in {}", id, entry.trigger_spec, entry.timezone);
        self.wake.notify_one();
        Ok(entry)
    }

    /// Delivers the entry's check-in right away, outside its regular cadence.
    /// Works on disabled entries too and leaves next-fire untouched.
    pub async fn fire_now(&self, owner_id: &str, id: &str) -> CareResult<ProactiveDelivery> {
        let entry = self.owned_entry(owner_id, id)?;
        let tz = parse_timezone(&entry.timezone).unwrap_or_else(|e| {
            warn!("Schedule {} has {}; using {}", id, e, self.default_timezone.name());
            self.default_timezone
        });
        let now = Utc::now();
        self.db.schedules.record_manual_firing(id, now)?;

        let instruction = check_in_instruction_at(now, &tz);
        match self.sessions.deliver_proactive(&entry.owner_id, &instruction).await {
            Ok(delivery) => {
                metrics::inc_schedule_fire(if delivery.intercepted { "intercepted" } else { "manual" });
                info!("Schedule {} fired on demand for {}", id, entry.owner_id);
                let _ = self.deliveries.send(delivery.clone());
                Ok(delivery)
            }
            Err(e) => {
                metrics::inc_schedule_fire("failed");
                Err(e)
            }
        }
    }

    pub fn delete_schedule(&self, owner_id: &str, id: &str) -> CareResult<()> {
        self.owned_entry(owner_id, id)?;
        self.db.schedules.delete(id)?;
        info!("Deleted schedule {}", id);
        Ok(())
    }

    fn owned_entry(&self, owner_id: &str, id: &str) -> CareResult<ScheduleEntry> {
        let entry = self.db.schedules.get(id)?.ok_or_else(|| CareError::NotFound {
            kind: "schedule",
            id: id.to_string(),
        })?;
        if entry.owner_id != owner_id {
            return Err(CareError::Forbidden {
                kind: "schedule",
                id: id.to_string(),
                owner_id: owner_id.to_string(),
            });
        }
        Ok(entry)
    }

    /// Fires every entry due at `now`; returns how many check-ins were delivered.
    pub async fn tick(&self, now: DateTime<Utc>) -> CareResult<usize> {
        let due = self.db.schedules.list_due(now)?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("{} schedule entries due at {}", due.len(), now);

        let mut firings = JoinSet::new();
        for entry in due {
            let tz = match self.advance(&entry, now) {
                Ok(Some(tz)) => tz,
                Ok(None) => continue,
                Err(e) => {
                    error!("Could not advance schedule {}: {}", entry.id, e);
                    metrics::inc_schedule_fire("failed");
                    continue;
                }
            };
            let sessions = Arc::clone(&self.sessions);
            let instruction = check_in_instruction_at(now, &tz);
            firings.spawn(async move {
                let result = sessions.deliver_proactive(&entry.owner_id, &instruction).await;
                (entry, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = firings.join_next().await {
            let (entry, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Check-in task panicked: {}", e);
                    metrics::inc_schedule_fire("failed");
                    continue;
                }
            };
            match result {
                Ok(delivery) => {
                    delivered += 1;
                    metrics::inc_schedule_fire(if delivery.intercepted { "intercepted" } else { "ok" });
                    info!("Schedule {} delivered check-in to {}", entry.id, entry.owner_id);
                    // No subscribers is fine; the message is already stored.
                    let _ = self.deliveries.send(delivery);
                }
                Err(e) => {
                    metrics::inc_schedule_fire("failed");
                    warn!("Schedule {} check-in for {} failed: {}", entry.id, entry.owner_id, e);
                }
            }
        }
        Ok(delivered)
    }

    /// Moves the entry's next-fire past `now`. Entries whose trigger or
    /// timezone no longer resolves are disabled instead.
    fn advance(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> CareResult<Option<Tz>> {
        let resolved = TriggerSpec::parse(&entry.trigger_spec).and_then(|spec| {
            let tz = parse_timezone(&entry.timezone)?;
            Ok((spec.next_after(now, &tz)?, tz))
        });
        match resolved {
            Ok((next_fire, tz)) => {
                if now - entry.next_fire > chrono::Duration::seconds(self.poll.as_secs() as i64 * 2) {
                    info!(
                        "Schedule {} missed its firing at {}; catching up once",
                        entry.id, entry.next_fire
                    );
                }
                self.db.schedules.record_firing(&entry.id, now, next_fire)?;
                Ok(Some(tz))
            }
            Err(e) => {
                error!("Disabling schedule {}: {}", entry.id, e);
                self.db.schedules.set_enabled(&entry.id, false, entry.next_fire)?;
                metrics::inc_schedule_fire("invalid");
                Ok(None)
            }
        }
    }

    /// Runs until `shutdown` turns true or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Care scheduler started (poll every {:?})", self.poll);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!("Scheduler tick failed: {}", e);
            }

            let wait = match self.db.schedules.earliest_next_fire() {
                Ok(Some(next)) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(self.poll),
                Ok(None) => self.poll,
                Err(e) => {
                    warn!("Could not read next fire time: {}", e);
                    self.poll
                }
            };
            let wait = wait.max(MIN_SLEEP);
            debug!("Scheduler sleeping for {:?}", wait);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => debug!("Scheduler woken by a schedule change"),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Care scheduler stopped");
    }
}
