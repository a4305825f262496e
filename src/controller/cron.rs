//! Crontab-style scheduler.
//!
//! Entries follow crontab(5) semantics over `{minute, hour, day-of-month,
//! month, day-of-week}`. All arithmetic is UTC wall-clock with seconds
//! fixed at zero. Entries are kept in a min-heap keyed by next expiration;
//! a single timer task is armed at the head's delta and re-armed whenever
//! the head changes. February is treated as 28 days; leap years are not
//! handled specially, so a schedule pinned to February 29 never fires.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

/// A crontab(5) entry. Empty fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSchedule {
    pub min: String,
    pub hour: String,
    pub day: String,
    pub month: String,
    pub weekday: String,
}

/// Parsed field sets; `None` means unconstrained.
#[derive(Debug, Clone, Default)]
pub struct CompiledSchedule {
    min: Option<Vec<u32>>,
    hour: Option<Vec<u32>>,
    day_of_month: Option<Vec<u32>>,
    month: Option<Vec<u32>>,
    weekday: Option<Vec<u32>>,
}

const MONTH_NAMES: [(&str, u32); 12] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const WEEKDAY_NAMES: [(&str, u32); 7] = [
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

const MONTH_DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Parse one field: wildcard, comma list of ints, `a-b` ranges, or
/// symbolic names. Duplicate values are rejected.
fn parse_field(s: &str, names: &[(&str, u32)]) -> Result<Option<Vec<u32>>> {
    if s.is_empty() || s == "*" {
        return Ok(None);
    }
    let mut values = Vec::new();
    for element in s.split(',') {
        if let Some(&(_, v)) = names.iter().find(|(name, _)| *name == element) {
            values.push(v);
            continue;
        }
        if let Some((lo, hi)) = element.split_once('-') {
            let lo: u32 = lo.parse()?;
            let hi: u32 = hi.parse()?;
            for v in lo..=hi {
                values.push(v);
            }
            continue;
        }
        values.push(element.parse()?);
    }
    values.sort_unstable();
    for pair in values.windows(2) {
        if pair[0] == pair[1] {
            bail!("duplicate value {}", pair[0]);
        }
    }
    Ok(Some(values))
}

pub fn compile(schedule: &CronSchedule) -> Result<CompiledSchedule> {
    Ok(CompiledSchedule {
        min: parse_field(&schedule.min, &[])?,
        hour: parse_field(&schedule.hour, &[])?,
        day_of_month: parse_field(&schedule.day, &[])?,
        month: parse_field(&schedule.month, &MONTH_NAMES)?,
        weekday: parse_field(&schedule.weekday, &WEEKDAY_NAMES)?,
    })
}

/// Smallest set member `>= x`, wrapping to the set minimum; `x` itself when
/// the field is unconstrained.
fn next_value(x: u32, set: Option<&Vec<u32>>) -> u32 {
    match set {
        None => x,
        Some(values) => values
            .iter()
            .copied()
            .find(|v| *v >= x)
            .unwrap_or(values[0]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CalDate {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    min: u32,
}

impl CalDate {
    fn from_datetime(t: DateTime<Utc>) -> CalDate {
        CalDate {
            year: t.year(),
            month: t.month(),
            day: t.day(),
            hour: t.hour(),
            min: t.minute(),
        }
    }

    fn inc_month(&mut self) -> bool {
        self.month += 1;
        if self.month > 12 {
            self.month = 1;
            self.year += 1;
            return true;
        }
        false
    }

    fn inc_day(&mut self, delta: u32) -> bool {
        self.day += delta;
        if self.day > MONTH_DAYS[(self.month - 1) as usize] {
            self.day = 1;
            self.inc_month();
            return true;
        }
        false
    }

    fn inc_hour(&mut self) -> bool {
        self.hour += 1;
        if self.hour >= 24 {
            self.hour = 0;
            self.inc_day(1);
            return true;
        }
        false
    }

    fn inc_min(&mut self) -> bool {
        self.min += 1;
        if self.min >= 60 {
            self.min = 0;
            self.inc_hour();
            return true;
        }
        false
    }

    fn weekday(&self) -> u32 {
        self.date().weekday().num_days_from_sunday()
    }

    // Out-of-range days normalize forward into the next month, matching
    // calendar arithmetic rather than failing.
    fn date(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .expect("valid year-month")
            + chrono::Duration::days(i64::from(self.day) - 1)
    }

    fn to_datetime(self) -> DateTime<Utc> {
        let date = self.date();
        Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), self.hour, self.min, 0)
            .single()
            .expect("valid utc timestamp")
    }
}

/// Next UTC minute strictly greater than `current` matching every field.
///
/// Fields are walked outer to inner (month, day, hour, minute); whenever a
/// field wraps below its current value the lower-order fields reset to
/// their minima and the walk restarts. When day-of-month is constrained it
/// drives day advancement; otherwise a constrained weekday advances forward
/// by up to seven days.
pub fn next_fire(current: DateTime<Utc>, r: &CompiledSchedule) -> DateTime<Utc> {
    let mut dt = CalDate::from_datetime(current);

    let mut i = 0u32;
    loop {
        let mut next = dt;

        let m = next_value(next.month, r.month.as_ref());
        if m != next.month {
            next.month = m;
            next.day = 1;
            next.hour = 0;
            next.min = 0;
            if next.month < dt.month {
                next.year += 1;
            }
        }

        let d = next_value(next.day, r.day_of_month.as_ref());
        if d != next.day {
            let carry = d < next.day;
            next.day = d;
            next.hour = 0;
            next.min = 0;
            if carry {
                next.inc_month();
                dt = next;
                i += 1;
                continue;
            }
        } else if r.weekday.is_some() {
            let wk_current = next.weekday();
            let wk_next = next_value(wk_current, r.weekday.as_ref());
            if wk_next != wk_current {
                next.hour = 0;
                next.min = 0;
                let delta = if wk_next < wk_current {
                    (7 - wk_current) + wk_next
                } else {
                    wk_next - wk_current
                };
                if next.inc_day(delta) {
                    dt = next;
                    i += 1;
                    continue;
                }
            }
        }

        let h = next_value(next.hour, r.hour.as_ref());
        if h != next.hour {
            let carry = h < next.hour;
            next.hour = h;
            next.min = 0;
            if carry {
                next.inc_day(1);
                dt = next;
                i += 1;
                continue;
            }
        }

        // The returned instant must be strictly in the future: when the
        // current minute already matches everything, step one minute first.
        if i == 0 && next == dt && next.inc_min() {
            dt = next;
            i += 1;
            continue;
        }

        let m = next_value(next.min, r.min.as_ref());
        if m != next.min {
            let carry = m < next.min;
            next.min = m;
            if carry {
                next.inc_hour();
                dt = next;
                i += 1;
                continue;
            }
        }

        return next.to_datetime();
    }
}

pub type CronCallback = Arc<dyn Fn() + Send + Sync>;
type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct HeapItem {
    expires: DateTime<Utc>,
    name: String,
    generation: u64,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.expires == other.expires && self.generation == other.generation
    }
}
impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse order for min-heap (earliest first)
        other
            .expires
            .cmp(&self.expires)
            .then(other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct CronEntry {
    schedule: CronSchedule,
    compiled: CompiledSchedule,
    callback: CronCallback,
    generation: u64,
    expires: DateTime<Utc>,
}

struct CronInner {
    entries: HashMap<String, CronEntry>,
    heap: BinaryHeap<HeapItem>,
    timer: Option<tokio::task::AbortHandle>,
    generation: u64,
    clock: Clock,
}

impl CronInner {
    /// Drop heap items whose entry was deleted or replaced. `delete` only
    /// invalidates; the heap is cleaned lazily here and at pop time.
    fn prune_dead(&mut self) {
        while let Some(head) = self.heap.peek() {
            let live = self
                .entries
                .get(&head.name)
                .is_some_and(|e| e.generation == head.generation);
            if live {
                return;
            }
            self.heap.pop();
        }
    }
}

/// Fires pipeline-start callbacks at crontab-accurate UTC minutes. One
/// timer task is armed at a time; a single mutex guards the entry map, the
/// heap and the timer handle, and callbacks run with it released.
#[derive(Clone)]
pub struct CronService {
    inner: Arc<Mutex<CronInner>>,
}

impl CronService {
    pub fn new() -> CronService {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Injectable clock, for deterministic tests.
    pub fn with_clock(clock: Clock) -> CronService {
        CronService {
            inner: Arc::new(Mutex::new(CronInner {
                entries: HashMap::new(),
                heap: BinaryHeap::new(),
                timer: None,
                generation: 0,
                clock,
            })),
        }
    }

    /// Register `callback` to fire at each instant matching `schedule`.
    /// Replaces any existing entry with the same name.
    pub fn add(&self, name: &str, schedule: &CronSchedule, callback: CronCallback) -> Result<()> {
        let compiled = compile(schedule)?;
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        let generation = inner.generation;
        let expires = next_fire((inner.clock)(), &compiled);
        debug!("cron entry {name} expires at {expires}");
        inner.entries.insert(
            name.to_string(),
            CronEntry {
                schedule: schedule.clone(),
                compiled,
                callback,
                generation,
                expires,
            },
        );
        inner.heap.push(HeapItem {
            expires,
            name: name.to_string(),
            generation,
        });
        Self::rearm_locked(&self.inner, &mut inner);
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(name).is_none() {
            return Err(anyhow!("cron {name} not found"));
        }
        Self::rearm_locked(&self.inner, &mut inner);
        Ok(())
    }

    pub fn list(&self) -> HashMap<String, CronSchedule> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.schedule.clone()))
            .collect()
    }

    /// Expiration of the current head entry, if any.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock().unwrap();
        inner.prune_dead();
        inner.heap.peek().map(|item| item.expires)
    }

    /// Timer handler: pop the head entry, invoke its callback with the lock
    /// released, then re-push at its next expiration and re-arm. Exposed so
    /// tests can drive the timer deterministically.
    pub fn fire_next(&self) {
        Self::fire(&self.inner);
    }

    fn fire(inner_arc: &Arc<Mutex<CronInner>>) {
        let (name, generation, callback, expired_at) = {
            let mut inner = inner_arc.lock().unwrap();
            inner.prune_dead();
            let Some(item) = inner.heap.pop() else {
                inner.timer = None;
                return;
            };
            let entry = inner.entries.get(&item.name).expect("pruned head is live");
            (item.name, item.generation, entry.callback.clone(), item.expires)
        };

        callback();

        let mut inner = inner_arc.lock().unwrap();
        // Skip the re-push when the entry was deleted or replaced while the
        // callback ran.
        if let Some(entry) = inner.entries.get_mut(&name) {
            if entry.generation == generation {
                let expires = next_fire(expired_at, &entry.compiled);
                debug!("cron entry {name} next expiration {expires}");
                entry.expires = expires;
                inner.heap.push(HeapItem {
                    expires,
                    name,
                    generation,
                });
            }
        }
        Self::rearm_locked(inner_arc, &mut inner);
    }

    fn rearm_locked(inner_arc: &Arc<Mutex<CronInner>>, inner: &mut CronInner) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.prune_dead();
        let Some(head) = inner.heap.peek() else {
            return;
        };
        // Outside a runtime (synchronous tests) the timer stays disarmed
        // and `fire_next` drives the heap.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delta = (head.expires - (inner.clock)())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let arc = inner_arc.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(delta).await;
            CronService::fire(&arc);
        });
        inner.timer = Some(task.abort_handle());
    }
}

impl Default for CronService {
    fn default() -> Self {
        Self::new()
    }
}
