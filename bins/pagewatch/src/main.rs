use pagewatch_config::EngineConfig;
use pagewatch_engine::{ValuePayload, WatchRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = "config/pagewatch.toml";
    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(_) => EngineConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    pagewatch_engine::init(config)?;
    pagewatch_engine::set_callback(Some(Box::new(|event| {
        let new = match &event.new_value {
            ValuePayload::Inline(bytes) => format!("{} inline bytes", bytes.len()),
            ValuePayload::Spilled(key) => format!("spilled as {key}"),
            ValuePayload::Unavailable => "unavailable".into(),
        };
        info!(
            seq = event.seq,
            region = event.region_id,
            epoch = event.epoch,
            name = event.name.as_deref().unwrap_or("<anonymous>"),
            new_value = %new,
            "change"
        );
    })))?;

    // Demo region: watch a counter and mutate it so the pipeline is visible.
    let counter = vec![0u8; 64];
    let region = unsafe {
        pagewatch_engine::watch(WatchRequest {
            addr: counter.as_ptr() as usize,
            len: counter.len(),
            adapter_id: 0,
            name: Some("demo-counter".into()),
            user_data: 0,
            location: None,
        })?
    };
    info!(region, "watching demo counter, writing to it");

    for i in 0..5u8 {
        unsafe { std::ptr::write_volatile(counter.as_ptr().cast_mut().add(8), i + 1) };
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    let stats = pagewatch_engine::stats()?;
    info!(
        events = stats.total_events,
        ring_writes = stats.ring_writes,
        ring_drops = stats.ring_drops,
        "done"
    );

    pagewatch_engine::unwatch(region);
    pagewatch_engine::shutdown();
    Ok(())
}
