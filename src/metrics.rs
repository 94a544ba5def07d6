//! Process-wide counters and gauges, rendered in Prometheus text format.
//!
//! These are the only state shared freely across sessions, so everything
//! here is a plain atomic that is safe to bump from any task.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Monotonic counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge that can go up and down.
#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub const fn new() -> Self {
        Gauge(AtomicI64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram. Buckets are upper bounds in seconds.
pub struct Histogram {
    buckets: &'static [f64],
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: &'static [f64]) -> Self {
        Histogram {
            buckets,
            counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        // CAS loop because there is no native atomic f64 add.
        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) + value;
            match self.sum_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    fn render(&self, name: &str, out: &mut String) {
        use std::fmt::Write;
        for (i, bound) in self.buckets.iter().enumerate() {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.counts[i].load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", self.count());
        let _ = writeln!(out, "{name}_sum {}", self.sum());
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

const SESSION_DURATION_BINS: &[f64] = &[1.0, 10.0, 30.0, 60.0, 120.0, 240.0, 480.0, 960.0, 1920.0];
const TOOL_LATENCY_BINS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25];
const LOAD_DURATION_BINS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0];

pub static SESSIONS: Counter = Counter::new();
pub static ACTIVE_SESSIONS: Gauge = Gauge::new();
pub static SESSION_DURATION: Lazy<Histogram> = Lazy::new(|| Histogram::new(SESSION_DURATION_BINS));
pub static FATAL_SERVICE_MISSES: Counter = Counter::new();
pub static FORCE_DISCONNECTS: Counter = Counter::new();
pub static HARD_ERRORS: Counter = Counter::new();
pub static INVALID_FRAMES: Counter = Counter::new();
pub static INTERRUPTIONS: Counter = Counter::new();

pub static TOOL_CALLS: Counter = Counter::new();
pub static TOOL_ERRORS_JSON_PARSE: Counter = Counter::new();
pub static TOOL_ERRORS_VALIDATION: Counter = Counter::new();
pub static TOOL_ERRORS_TIMEOUT: Counter = Counter::new();
pub static TOOL_ERRORS_EXECUTION: Counter = Counter::new();
pub static TOOL_LATENCY: Lazy<Histogram> = Lazy::new(|| Histogram::new(TOOL_LATENCY_BINS));

pub static CHARACTER_LOADS: Counter = Counter::new();
pub static CHARACTERS_LOADED: Gauge = Gauge::new();
pub static CHARACTER_LOAD_DURATION: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(LOAD_DURATION_BINS));
pub static CHARACTER_SWITCHES: Counter = Counter::new();
pub static HISTORY_TRUNCATIONS: Counter = Counter::new();

/// Render everything in Prometheus text exposition format.
pub fn render_prometheus() -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(2048);
    let counters: &[(&str, &Counter)] = &[
        ("gateway_sessions_total", &SESSIONS),
        ("gateway_fatal_service_misses_total", &FATAL_SERVICE_MISSES),
        ("gateway_force_disconnects_total", &FORCE_DISCONNECTS),
        ("gateway_hard_errors_total", &HARD_ERRORS),
        ("gateway_invalid_frames_total", &INVALID_FRAMES),
        ("gateway_interruptions_total", &INTERRUPTIONS),
        ("gateway_tool_calls_total", &TOOL_CALLS),
        ("gateway_character_loads_total", &CHARACTER_LOADS),
        ("gateway_character_switches_total", &CHARACTER_SWITCHES),
        ("gateway_history_truncations_total", &HISTORY_TRUNCATIONS),
    ];
    for (name, counter) in counters {
        let _ = writeln!(out, "{name} {}", counter.get());
    }

    let tool_errors: &[(&str, &Counter)] = &[
        ("json_parse", &TOOL_ERRORS_JSON_PARSE),
        ("validation", &TOOL_ERRORS_VALIDATION),
        ("timeout", &TOOL_ERRORS_TIMEOUT),
        ("execution", &TOOL_ERRORS_EXECUTION),
    ];
    for (class, counter) in tool_errors {
        let _ = writeln!(
            out,
            "gateway_tool_errors_total{{class=\"{class}\"}} {}",
            counter.get()
        );
    }

    let _ = writeln!(out, "gateway_active_sessions {}", ACTIVE_SESSIONS.get());
    let _ = writeln!(out, "gateway_characters_loaded {}", CHARACTERS_LOADED.get());

    SESSION_DURATION.render("gateway_session_duration_seconds", &mut out);
    TOOL_LATENCY.render("gateway_tool_latency_seconds", &mut out);
    CHARACTER_LOAD_DURATION.render("gateway_character_load_duration_seconds", &mut out);

    out
}
