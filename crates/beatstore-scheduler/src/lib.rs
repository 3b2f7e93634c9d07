//! `beatstore-scheduler` - SQLite persistence and change notification for
//! periodic task definitions.
//!
//! # Overview
//!
//! Task entries live in the `periodic_task` table and link to exactly one
//! shared schedule row (interval, crontab or solar). Every mutation made
//! through [`PeriodicStore`] stamps the single-row change ledger in the same
//! transaction, so a scheduler process can poll one value
//! ([`PeriodicStore::last_change_timestamp`]) instead of re-reading every
//! entry. [`ChangeWatcher`] does that polling and hands out fresh entry sets.
//!
//! # Schedule kinds
//!
//! | Kind       | Fires                                                   |
//! |------------|---------------------------------------------------------|
//! | `Interval` | Every N days/hours/minutes/seconds/microseconds         |
//! | `Crontab`  | When all five cron fields match, in the rule's timezone |
//! | `Solar`    | At a sunrise/sunset/twilight/noon event for a location  |

pub mod clock;
pub mod cron;
pub mod db;
pub mod error;
pub mod ledger;
pub mod schedule;
pub mod solar;
pub mod store;
pub mod types;
pub mod watcher;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError};
pub use schedule::ScheduleRule;
pub use store::PeriodicStore;
pub use types::{
    CrontabSchedule, CrontabSpec, IntervalPeriod, IntervalSchedule, NewTask, Notify, ScheduleRef,
    ScheduleSpec, SolarEvent, SolarSchedule, TaskEntry, TaskUpdate,
};
pub use watcher::{ChangeWatcher, Reload};
