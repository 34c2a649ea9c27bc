use prometheus::{
    HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec,
};

/// Per-controller instruments, registered on the default registry the scrape
/// server gathers from.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = register_int_counter_vec!(
            format!("gsorch_{}_reconciles_total", controller),
            "Total number of reconciliations, including no-ops.",
            &["name", "namespace"]
        )
        .unwrap();
        let action_counter = register_int_counter_vec!(
            format!("gsorch_{}_actions_total", controller),
            "Reconciliation outcomes by action kind.",
            &["name", "namespace", "action"]
        )
        .unwrap();
        let read_histogram = register_histogram_vec!(
            format!("gsorch_{}_read_phase_seconds", controller),
            "Time spent deciding what to do.",
            &["name", "namespace", "action"]
        )
        .unwrap();
        let write_histogram = register_histogram_vec!(
            format!("gsorch_{}_write_phase_seconds", controller),
            "Time spent applying the decided action.",
            &["name", "namespace", "action"]
        )
        .unwrap();
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}
