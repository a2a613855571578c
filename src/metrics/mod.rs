use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

// 全局服务启动时间
static SERVICE_START_TIME: OnceLock<SystemTime> = OnceLock::new();

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref REQUEST_COUNTER: Counter = Counter::with_opts(
        Opts::new("meme_requests_total", "Total number of meme requests")
    ).expect("valid metric");

    pub static ref RESPONSE_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("meme_response_duration_seconds", "Response time for meme requests")
    ).expect("valid metric");

    pub static ref COMPOSE_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("meme_compose_duration_seconds", "Time spent decoding and compositing memes")
    ).expect("valid metric");

    pub static ref MEMES_COMPOSED: Counter = Counter::with_opts(
        Opts::new("memes_composed_total", "Total number of composed memes")
    ).expect("valid metric");

    pub static ref MEMES_SAVED: Counter = Counter::with_opts(
        Opts::new("memes_saved_total", "Total number of memes saved to the library")
    ).expect("valid metric");

    pub static ref MEMES_SHARED: Counter = Counter::with_opts(
        Opts::new("memes_shared_total", "Total number of shared memes")
    ).expect("valid metric");

    pub static ref SAVE_FAILURES: Counter = Counter::with_opts(
        Opts::new("meme_save_failures_total", "Total number of failed saves")
    ).expect("valid metric");

    pub static ref SERVICE_UPTIME_SECONDS: Gauge = Gauge::with_opts(
        Opts::new("service_uptime_seconds", "Service uptime in seconds")
    ).expect("valid metric");

    pub static ref TOTAL_MEMES: Gauge = Gauge::with_opts(
        Opts::new("total_memes", "Total number of memes in the library")
    ).expect("valid metric");

    pub static ref CACHE_HITS: Counter = Counter::with_opts(
        Opts::new("render_cache_hits_total", "Total number of render cache hits")
    ).expect("valid metric");

    pub static ref CACHE_MISSES: Counter = Counter::with_opts(
        Opts::new("render_cache_misses_total", "Total number of render cache misses")
    ).expect("valid metric");
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(REQUEST_COUNTER.clone()))?;
    REGISTRY.register(Box::new(RESPONSE_TIME.clone()))?;
    REGISTRY.register(Box::new(COMPOSE_TIME.clone()))?;
    REGISTRY.register(Box::new(MEMES_COMPOSED.clone()))?;
    REGISTRY.register(Box::new(MEMES_SAVED.clone()))?;
    REGISTRY.register(Box::new(MEMES_SHARED.clone()))?;
    REGISTRY.register(Box::new(SAVE_FAILURES.clone()))?;
    REGISTRY.register(Box::new(SERVICE_UPTIME_SECONDS.clone()))?;
    REGISTRY.register(Box::new(TOTAL_MEMES.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES.clone()))?;
    Ok(())
}

/// 设置服务启动时间
pub fn set_service_start_time(start_time: SystemTime) {
    SERVICE_START_TIME.set(start_time).ok();
}

pub fn get_metrics() -> String {
    // 按需更新服务运行时间
    if let Some(start_time) = SERVICE_START_TIME.get() {
        if let Ok(uptime) = start_time.elapsed() {
            SERVICE_UPTIME_SECONDS.set(uptime.as_secs() as f64);
        }
    }

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("编码指标失败: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 离开作用域时把耗时记入直方图
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.histogram.observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_one_observation() {
        let histogram: &'static Histogram = Box::leak(Box::new(
            Histogram::with_opts(HistogramOpts::new("test_timer_seconds", "test")).unwrap(),
        ));
        {
            let _timer = Timer::new(histogram);
        }
        assert_eq!(histogram.get_sample_count(), 1);
    }
}
