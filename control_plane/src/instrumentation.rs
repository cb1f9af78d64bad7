use crate::apisix::ResourceKind;
use crate::cluster::Operation;
use opentelemetry::KeyValue;
use opentelemetry::global::meter;
use opentelemetry::metrics::{Counter, Meter};
use std::sync::LazyLock;

pub(crate) static METER: LazyLock<Meter> =
    LazyLock::new(|| meter("apisix-ingress-control-plane"));

static REMOTE_WRITES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("apisix_sync_remote_writes")
        .with_description("Writes issued against the APISIX admin API")
        .build()
});

pub(crate) fn record_remote_write(kind: ResourceKind, operation: Operation, succeeded: bool) {
    REMOTE_WRITES.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("outcome", if succeeded { "success" } else { "failure" }),
        ],
    );
}
