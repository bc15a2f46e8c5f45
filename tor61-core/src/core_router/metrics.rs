/*
    Metrics - protocol counters for monitoring a router

    Recorded through the `metrics` facade; nothing is exported unless the
    embedding process installs a recorder.
*/

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "tor61_cells_received_total",
        "Total number of well-formed cells received from peers, labeled by cell type"
    );

    describe_counter!(
        "tor61_malformed_cells_total",
        "Total number of frames dropped because they failed to decode"
    );

    describe_counter!(
        "tor61_cells_forwarded_total",
        "Total number of relay cells forwarded to the next leg of a circuit"
    );

    describe_counter!(
        "tor61_circuits_built_total",
        "Total number of entry circuits that completed every extension"
    );

    describe_counter!(
        "tor61_circuit_rebuilds_total",
        "Total number of entry circuit rebuilds, labeled by reason"
    );

    describe_counter!(
        "tor61_probes_total",
        "Total number of entry circuit health probes, labeled by result (pass, fail)"
    );

    describe_gauge!(
        "tor61_forwarding_entries",
        "Current number of entries in the forwarding table"
    );
}

pub fn cell_received(kind: &'static str) {
    counter!("tor61_cells_received_total", "type" => kind).increment(1);
}

pub fn malformed_cell() {
    counter!("tor61_malformed_cells_total").increment(1);
}

pub fn cell_forwarded() {
    counter!("tor61_cells_forwarded_total").increment(1);
}

pub fn circuit_built() {
    counter!("tor61_circuits_built_total").increment(1);
}

pub fn circuit_rebuild(reason: &'static str) {
    counter!("tor61_circuit_rebuilds_total", "reason" => reason).increment(1);
}

pub fn probe_result(passed: bool) {
    let result = if passed { "pass" } else { "fail" };
    counter!("tor61_probes_total", "result" => result).increment(1);
}

pub fn forwarding_entries(count: usize) {
    gauge!("tor61_forwarding_entries").set(count as f64);
}
