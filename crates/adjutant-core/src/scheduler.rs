//! Time-driven job table.
//!
//! Cadences are simple strings (`every 30m`, `hourly`, `daily 08:00`,
//! `weekly mon 07:00`). Triggers are edge-triggered against the wall clock:
//! a job fires when its due instant has passed, the next due instant is
//! computed from the completion time, and ticks missed during downtime are
//! not replayed. Jobs run to completion inside `tick`, which makes
//! same-job overlap impossible by construction; failures are logged and
//! never escape the scheduler.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Datelike, Local, NaiveTime, TimeZone, Timelike, Weekday};

use adjutant_retry::SharedClock;
use adjutant_types::{EventKind, LogRecord};
use adjutant_vault::Vault;

/// When a job recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed period from the previous completion.
    Every(Duration),
    /// Top of every hour.
    Hourly,
    /// Every day at a local time.
    Daily(NaiveTime),
    /// Every week on a day at a local time.
    Weekly(Weekday, NaiveTime),
}

impl Cadence {
    /// First due instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Local>) -> DateTime<Local> {
        match self {
            Cadence::Every(period) => {
                now + chrono::Duration::from_std(*period).unwrap_or(chrono::Duration::zero())
            }
            Cadence::Hourly => {
                let truncated = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                truncated + chrono::Duration::hours(1)
            }
            Cadence::Daily(at) => {
                let today = resolve_local(now, now.date_naive().and_time(*at));
                if today > now {
                    today
                } else {
                    resolve_local(
                        now,
                        (now.date_naive() + chrono::Duration::days(1)).and_time(*at),
                    )
                }
            }
            Cadence::Weekly(weekday, at) => {
                let mut date = now.date_naive();
                for _ in 0..8 {
                    if date.weekday() == *weekday {
                        let candidate = resolve_local(now, date.and_time(*at));
                        if candidate > now {
                            return candidate;
                        }
                    }
                    date += chrono::Duration::days(1);
                }
                now + chrono::Duration::days(7)
            }
        }
    }
}

/// Resolve a naive local datetime, taking the earliest instant on DST
/// ambiguity and nudging forward across DST gaps.
fn resolve_local(fallback: DateTime<Local>, naive: chrono::NaiveDateTime) -> DateTime<Local> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| Local.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .unwrap_or(fallback)
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Every(d) => write!(f, "every {}", humantime::format_duration(*d)),
            Cadence::Hourly => f.write_str("hourly"),
            Cadence::Daily(at) => write!(f, "daily {}", at.format("%H:%M")),
            Cadence::Weekly(day, at) => {
                write!(f, "weekly {} {}", weekday_name(*day), at.format("%H:%M"))
            }
        }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        match parts.as_slice() {
            ["hourly"] => Ok(Cadence::Hourly),
            ["every", period] => humantime::parse_duration(period)
                .map(Cadence::Every)
                .map_err(|e| format!("bad period '{period}': {e}")),
            ["daily", at] => parse_time(at).map(Cadence::Daily),
            ["weekly", day, at] => {
                let weekday = match *day {
                    "mon" => Weekday::Mon,
                    "tue" => Weekday::Tue,
                    "wed" => Weekday::Wed,
                    "thu" => Weekday::Thu,
                    "fri" => Weekday::Fri,
                    "sat" => Weekday::Sat,
                    "sun" => Weekday::Sun,
                    other => return Err(format!("bad weekday '{other}'")),
                };
                parse_time(at).map(|t| Cadence::Weekly(weekday, t))
            }
            _ => Err(format!(
                "bad cadence '{s}' (expected 'every <dur>' | 'hourly' | 'daily HH:MM' | 'weekly <day> HH:MM')"
            )),
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("bad time '{s}': {e}"))
}

type Task = Box<dyn FnMut(&Vault) -> Result<String> + Send>;

struct Job {
    name: String,
    cadence: Cadence,
    task: Task,
    next_due: DateTime<Local>,
}

/// The job table. One instance per orchestrator process.
pub struct Scheduler {
    vault: Vault,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(vault: &Vault) -> Self {
        Self {
            vault: vault.as_actor("scheduler"),
            jobs: Vec::new(),
        }
    }

    /// Register a job. The first firing is one full cadence after `now`
    /// (or the next daily/weekly instant).
    pub fn add_job(
        &mut self,
        name: impl Into<String>,
        cadence: Cadence,
        now: DateTime<Local>,
        task: Task,
    ) {
        self.jobs.push(Job {
            name: name.into(),
            cadence,
            task,
            next_due: cadence.next_after(now),
        });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    /// Run every due job to completion. Returns how many jobs ran.
    pub fn tick(&mut self, now: DateTime<Local>) -> usize {
        let mut ran = 0;
        for job in &mut self.jobs {
            if now < job.next_due {
                continue;
            }
            let (result, detail) = match (job.task)(&self.vault) {
                Ok(detail) => ("ok".to_string(), detail),
                Err(e) => ("error".to_string(), format!("{e:#}")),
            };
            // Log failures too; the scheduler itself never crashes on a
            // job error.
            let _ = self.vault.append(
                LogRecord::new(EventKind::SchedulerJob, self.vault.actor())
                    .with_action(job.name.clone())
                    .with_result(result)
                    .with_detail(detail),
            );
            // Next instant from the firing tick: missed ticks are dropped.
            job.next_due = job.cadence.next_after(now);
            ran += 1;
        }
        ran
    }

    /// Tick until cancelled.
    pub fn run(&mut self, cancel: &AtomicBool, clock: &SharedClock) {
        while !cancel.load(Ordering::Relaxed) {
            self.tick(Local::now());
            clock.sleep(Duration::from_secs(1));
        }
    }

    /// Run every job once immediately, regardless of schedule (`--once`).
    pub fn run_all_now(&mut self) -> usize {
        for job in &mut self.jobs {
            job.next_due = Local::now() - chrono::Duration::seconds(1);
        }
        self.tick(Local::now())
    }
}
