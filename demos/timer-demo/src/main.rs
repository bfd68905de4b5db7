use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Context;
use tracing::info;

use evloop_core::{check_cancelled, sleep};
use evloop_exec::prelude::*;
use evloop_observe::{LoggerConfig, logger_init};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Logger
    let cfg = LoggerConfig::from_env()?;
    logger_init(&cfg)?;
    info!("logger initialized ({})", cfg.format);

    // 2) Loop group
    let group = MultiThreadedEventLoopGroup::with_config(LoopGroupConfig {
        threads: 2,
        thread_name_prefix: "demo-loop".to_string(),
    })
    .context("starting loop group")?;
    info!("loop group ready: {} loops", group.loops().len());

    // 3) Timers: one fires, one is cancelled before its deadline
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let kept = group.next().set_timer_in(
        TimeAmount::milliseconds(20),
        Arc::new(move |event_loop: &dyn EventLoop| {
            counter.fetch_add(1, Ordering::SeqCst);
            info!("timer fired on {}", event_loop.label());
        }),
    );
    let counter = Arc::clone(&fired);
    let dropped = group.next().set_timer_in(
        TimeAmount::milliseconds(40),
        Arc::new(move |_: &dyn EventLoop| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    dropped.cancel();
    info!("timers set: kept={:?}, cancelled={:?}", kept.id(), dropped.id());

    // 4) Scheduled task with a result
    let scheduled = group
        .next()
        .schedule_task_in(TimeAmount::milliseconds(10), |event_loop| {
            Ok(format!("computed on {}", event_loop.label()))
        });
    info!("{}", scheduled.future().get().await?);

    // 5) Task bridge: a cancellable async body completing a promise
    let promise = Promise::<u64>::new();
    let handle = promise.complete_with_task(|token| async move {
        let mut ticks = 0;
        while ticks < 1_000 {
            sleep(&token, TimeAmount::milliseconds(5)).await?;
            check_cancelled(&token)?;
            ticks += 1;
        }
        Ok(ticks)
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    handle.cancel();
    match promise.future().get().await {
        Ok(ticks) => info!("bridged task finished: {ticks} ticks"),
        Err(e) => info!("bridged task ended: {e}"),
    }
    handle.join().await?;

    // 6) Shutdown
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    info!("handlers fired: {}", fired.load(Ordering::SeqCst));
    group.shutdown_gracefully().await?;
    info!("shut down");

    Ok(())
}
