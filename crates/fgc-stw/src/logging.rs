//! Cycle Logging
//!
//! Structured events for the stop-the-world handshake and the table passes.
//! Free-form diagnostics go through the `log` facade; this module keeps a
//! buffered, filterable record of cycle events that can be printed as human
//! readable lines or JSON.
//!
//! Log Levels:
//! - ERROR: fatal collector conditions
//! - WARN: slow quiescence
//! - INFO: cycle start/end
//! - DEBUG: handshake phases, table passes
//! - TRACE: per-mutator transitions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Log level for cycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Stop-the-world event types
#[derive(Debug, Clone)]
pub enum StwEvent {
    /// Coordinator acquired both locks
    CycleStart { cycle: u64, targets: usize },

    /// Trap requests issued and fenced
    TrapsRequested { cycle: u64, requested: usize },

    /// One mutator reached a stopped state
    MutatorStopped {
        cycle: u64,
        mutator: u64,
        from_native: bool,
    },

    /// Quiescence took unusually long
    SlowQuiescence { cycle: u64, mutator: u64, waited_ms: u64 },

    /// All targeted mutators are stopped
    QuiescenceReached { cycle: u64, waited_us: u64 },

    /// Injected collection procedure returned
    CollectionComplete { cycle: u64, duration_us: u64 },

    /// Mutators released, locks dropped
    CycleEnd { cycle: u64, pause_us: u64 },

    /// Card range reset to CLEAN
    CardsCleared { first: usize, count: usize },

    /// SCAVENGED chunks returned to START
    ChunksRestored { restored: usize },

    /// Region walked by the verifier
    HeapVerified { objects: usize, references: usize, bytes: usize },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct StwLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,
}

impl Default for StwLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
        }
    }
}

/// StwLogger - buffered event log for collection cycles
pub struct StwLogger {
    config: StwLoggerConfig,
    events: Mutex<Vec<(Instant, StwEvent)>>,
    enabled: AtomicBool,
}

impl StwLogger {
    /// Create new logger
    pub fn new(config: StwLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log an event
    pub fn log(&self, event: StwEvent) {
        if !self.is_enabled() {
            return;
        }

        if event_level(&event) > self.config.level {
            return;
        }

        if self.config.console {
            let line = if self.config.json {
                render_json(&event)
            } else {
                render_human(&event)
            };
            if self.config.timestamps {
                let now = chrono::Local::now();
                println!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), line);
            } else {
                println!("{}", line);
            }
        }

        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), event));
        }
    }

    /// Get all events
    pub fn get_events(&self) -> Vec<(Instant, StwEvent)> {
        if let Ok(events) = self.events.lock() {
            events.clone()
        } else {
            Vec::new()
        }
    }

    /// Clear all events
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Get event count
    pub fn event_count(&self) -> usize {
        if let Ok(events) = self.events.lock() {
            events.len()
        } else {
            0
        }
    }
}

impl Default for StwLogger {
    fn default() -> Self {
        Self::new(StwLoggerConfig::default())
    }
}

fn event_level(event: &StwEvent) -> LogLevel {
    match event {
        StwEvent::SlowQuiescence { .. } => LogLevel::Warn,
        StwEvent::CycleStart { .. } | StwEvent::CycleEnd { .. } => LogLevel::Info,
        StwEvent::TrapsRequested { .. }
        | StwEvent::QuiescenceReached { .. }
        | StwEvent::CollectionComplete { .. }
        | StwEvent::CardsCleared { .. }
        | StwEvent::ChunksRestored { .. }
        | StwEvent::HeapVerified { .. } => LogLevel::Debug,
        StwEvent::MutatorStopped { .. } => LogLevel::Trace,
    }
}

/// Render an event as a human-readable line
pub fn render_human(event: &StwEvent) -> String {
    match event {
        StwEvent::CycleStart { cycle, targets } => {
            format!("[GC] Cycle {} started, stopping {} mutators", cycle, targets)
        },
        StwEvent::TrapsRequested { cycle, requested } => {
            format!("[GC] Cycle {}: {} trap requests issued", cycle, requested)
        },
        StwEvent::MutatorStopped {
            cycle,
            mutator,
            from_native,
        } => format!(
            "[GC] Cycle {}: mutator {} stopped ({})",
            cycle,
            mutator,
            if *from_native { "native" } else { "managed" }
        ),
        StwEvent::SlowQuiescence {
            cycle,
            mutator,
            waited_ms,
        } => format!(
            "[GC] Cycle {}: still waiting on mutator {} after {} ms",
            cycle, mutator, waited_ms
        ),
        StwEvent::QuiescenceReached { cycle, waited_us } => {
            format!("[GC] Cycle {}: all mutators stopped after {} us", cycle, waited_us)
        },
        StwEvent::CollectionComplete { cycle, duration_us } => {
            format!("[GC] Cycle {}: collection took {} us", cycle, duration_us)
        },
        StwEvent::CycleEnd { cycle, pause_us } => {
            format!("[GC] Cycle {} completed, pause {} us", cycle, pause_us)
        },
        StwEvent::CardsCleared { first, count } => {
            format!("[GC] Cleared {} cards from index {}", count, first)
        },
        StwEvent::ChunksRestored { restored } => {
            format!("[GC] Restored {} scavenged chunks", restored)
        },
        StwEvent::HeapVerified {
            objects,
            references,
            bytes,
        } => format!(
            "[GC] Verified {} objects, {} references, {} bytes",
            objects, references, bytes
        ),
    }
}

/// Render an event as a single JSON object
pub fn render_json(event: &StwEvent) -> String {
    let json = match event {
        StwEvent::CycleStart { cycle, targets } => serde_json::json!({
            "type": "cycle_start",
            "cycle": cycle,
            "targets": targets
        }),
        StwEvent::TrapsRequested { cycle, requested } => serde_json::json!({
            "type": "traps_requested",
            "cycle": cycle,
            "requested": requested
        }),
        StwEvent::MutatorStopped {
            cycle,
            mutator,
            from_native,
        } => serde_json::json!({
            "type": "mutator_stopped",
            "cycle": cycle,
            "mutator": mutator,
            "from_native": from_native
        }),
        StwEvent::SlowQuiescence {
            cycle,
            mutator,
            waited_ms,
        } => serde_json::json!({
            "type": "slow_quiescence",
            "cycle": cycle,
            "mutator": mutator,
            "waited_ms": waited_ms
        }),
        StwEvent::QuiescenceReached { cycle, waited_us } => serde_json::json!({
            "type": "quiescence_reached",
            "cycle": cycle,
            "waited_us": waited_us
        }),
        StwEvent::CollectionComplete { cycle, duration_us } => serde_json::json!({
            "type": "collection_complete",
            "cycle": cycle,
            "duration_us": duration_us
        }),
        StwEvent::CycleEnd { cycle, pause_us } => serde_json::json!({
            "type": "cycle_end",
            "cycle": cycle,
            "pause_us": pause_us
        }),
        StwEvent::CardsCleared { first, count } => serde_json::json!({
            "type": "cards_cleared",
            "first": first,
            "count": count
        }),
        StwEvent::ChunksRestored { restored } => serde_json::json!({
            "type": "chunks_restored",
            "restored": restored
        }),
        StwEvent::HeapVerified {
            objects,
            references,
            bytes,
        } => serde_json::json!({
            "type": "heap_verified",
            "objects": objects,
            "references": references,
            "bytes": bytes
        }),
    };

    json.to_string()
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<StwLogger> = Mutex::new(StwLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: StwEvent) {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.log(event);
    }
}

/// Replace the global logger configuration
pub fn configure_logger(config: StwLoggerConfig) {
    if let Ok(mut logger) = GLOBAL_LOGGER.lock() {
        *logger = StwLogger::new(config);
    }
}

/// Snapshot of the events buffered by the global logger
pub fn get_events() -> Vec<(Instant, StwEvent)> {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.get_events()
    } else {
        Vec::new()
    }
}

/// Get global logger event count
pub fn get_event_count() -> usize {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.event_count()
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_basic() {
        let logger = StwLogger::default();

        logger.log(StwEvent::CycleStart {
            cycle: 1,
            targets: 4,
        });

        assert_eq!(logger.event_count(), 1);
    }

    #[test]
    fn test_logger_level_filter() {
        let logger = StwLogger::default();

        // Trace is below the default Info level
        logger.log(StwEvent::MutatorStopped {
            cycle: 1,
            mutator: 7,
            from_native: true,
        });

        assert_eq!(logger.event_count(), 0);
    }

    #[test]
    fn test_logger_disable() {
        let logger = StwLogger::default();

        logger.disable();
        logger.log(StwEvent::CycleEnd {
            cycle: 1,
            pause_us: 10,
        });

        assert_eq!(logger.event_count(), 0);
    }

    #[test]
    fn test_json_render() {
        let line = render_json(&StwEvent::ChunksRestored { restored: 3 });
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "chunks_restored");
        assert_eq!(value["restored"], 3);
    }

    #[test]
    fn test_global_logger() {
        log_event(StwEvent::CycleStart {
            cycle: 99,
            targets: 0,
        });

        assert!(get_event_count() > 0);
    }
}
