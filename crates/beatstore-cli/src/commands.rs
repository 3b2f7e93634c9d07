use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::info;

use beatstore_core::BeatstoreConfig;
use beatstore_scheduler::{
    ChangeWatcher, CrontabSpec, NewTask, PeriodicStore, ScheduleSpec, TaskEntry,
};

use crate::{Commands, TaskArgs};

pub(crate) async fn execute(config: &BeatstoreConfig, command: Commands) -> Result<()> {
    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening SQLite database");
    let store = PeriodicStore::open(&config.database)
        .with_context(|| format!("opening {}", config.database.path))?;

    match command {
        Commands::AddInterval {
            task,
            every,
            period,
        } => add(&store, task, &ScheduleSpec::Interval { every, period }),
        Commands::AddCrontab {
            task,
            minute,
            hour,
            day_of_week,
            day_of_month,
            month_of_year,
            timezone,
        } => {
            let spec = CrontabSpec {
                minute,
                hour,
                day_of_week,
                day_of_month,
                month_of_year,
                timezone: timezone.unwrap_or_else(|| config.schedule.default_timezone.clone()),
            };
            add(&store, task, &ScheduleSpec::Crontab(spec))
        }
        Commands::AddSolar {
            task,
            event,
            latitude,
            longitude,
        } => add(
            &store,
            task,
            &ScheduleSpec::Solar {
                event,
                latitude,
                longitude,
            },
        ),
        Commands::List { enabled } => {
            let entries = if enabled {
                store.list_enabled_tasks()?
            } else {
                store.list_tasks()?
            };
            if entries.is_empty() {
                println!("no periodic tasks");
            }
            for entry in &entries {
                let flag = if entry.enabled { " " } else { "-" };
                println!(
                    "{flag} {:>4}  {}  [{} runs]",
                    entry.id,
                    store.describe_task(entry)?,
                    entry.total_run_count
                );
            }
            Ok(())
        }
        Commands::Show { name } => {
            let entry = find(&store, &name)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        Commands::Enable { name } => set_enabled(&store, &name, true),
        Commands::Disable { name } => set_enabled(&store, &name, false),
        Commands::Delete { name } => {
            let entry = find(&store, &name)?;
            store.delete_task(entry.id)?;
            println!("deleted {name}");
            Ok(())
        }
        Commands::LastChange => {
            match store.last_change_timestamp()? {
                Some(at) => println!("{}", at.to_rfc3339_opts(SecondsFormat::Micros, true)),
                None => println!("never"),
            }
            Ok(())
        }
        Commands::Next { name, count } => {
            let entry = find(&store, &name)?;
            let rule = store.materialize_schedule(&entry)?;
            let upcoming = rule.upcoming(Utc::now(), entry.last_run_at, count);
            if upcoming.is_empty() {
                println!("{name} never fires again");
            }
            for at in upcoming {
                println!("{}", at.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            Ok(())
        }
        Commands::Watch => watch(config, store).await,
    }
}

/// Resolve the schedule and insert the entry in one transaction.
fn add(store: &PeriodicStore, args: TaskArgs, schedule: &ScheduleSpec) -> Result<()> {
    let mut new = NewTask::unscheduled(args.name, args.task);
    new.args = args.args;
    new.kwargs = args.kwargs;
    new.queue = args.queue;
    new.priority = args.priority;
    new.one_off = args.one_off;
    new.enabled = !args.disabled;
    new.description = args.description;

    let entry = store.schedule_task(new, schedule)?;
    println!("added {}", store.describe_task(&entry)?);
    Ok(())
}

fn find(store: &PeriodicStore, name: &str) -> Result<TaskEntry> {
    store
        .get_task_by_name(name)?
        .with_context(|| format!("no periodic task named {name:?}"))
}

fn set_enabled(store: &PeriodicStore, name: &str, enabled: bool) -> Result<()> {
    let entry = find(store, name)?;
    let entry = store.set_enabled(entry.id, enabled)?;
    let state = if entry.enabled { "enabled" } else { "disabled" };
    println!("{state} {name}");
    Ok(())
}

async fn watch(config: &BeatstoreConfig, store: PeriodicStore) -> Result<()> {
    let store = Arc::new(store);
    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let watcher = tokio::spawn(ChangeWatcher::new().run(
        Arc::clone(&store),
        config.poll_interval(),
        reload_tx,
        shutdown_rx,
    ));

    loop {
        tokio::select! {
            reload = reload_rx.recv() => {
                let Some(reload) = reload else { break };
                let stamp = reload
                    .last_update
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true))
                    .unwrap_or_else(|| "never".to_string());
                println!("reload at {stamp}: {} enabled", reload.entries.len());
                for entry in &reload.entries {
                    println!("  {}", store.describe_task(entry)?);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    watcher.await?;
    Ok(())
}
