use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Millisecond buckets shared by both request-time histograms.
const REQ_TIME_BUCKETS: &[f64] = &[
    1.0, 10.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub struct Metrics {
    registry: Registry,
    pub dhcp_req_time: Histogram,
    pub dns_req_time: Histogram,
    pub dhcp_ops: IntCounterVec,
    pub dns_queries: IntCounterVec,
    pub dns_cache_hits: IntCounter,
    pub dns_blocked: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dhcp_req_time = Histogram::with_opts(
            HistogramOpts::new("dhcp_req_time", "dhcp request time in ms buckets")
                .buckets(REQ_TIME_BUCKETS.to_vec()),
        )?;
        let dns_req_time = Histogram::with_opts(
            HistogramOpts::new("dns_req_time", "dns request time in ms buckets")
                .buckets(REQ_TIME_BUCKETS.to_vec()),
        )?;
        let dhcp_ops = IntCounterVec::new(
            Opts::new("dhcp_op_counter", "count by type of operation"),
            &["op"],
        )?;
        let dns_queries = IntCounterVec::new(
            Opts::new("dns_query_counter", "count of queries by upstream"),
            &["upstream", "result"],
        )?;
        let dns_cache_hits = IntCounter::with_opts(Opts::new(
            "dns_cache_hit_counter",
            "count of answers served from cache",
        ))?;
        let dns_blocked = IntCounter::with_opts(Opts::new(
            "dns_blocked_domain_counter",
            "count of blocked domains",
        ))?;

        registry.register(Box::new(dhcp_req_time.clone()))?;
        registry.register(Box::new(dns_req_time.clone()))?;
        registry.register(Box::new(dhcp_ops.clone()))?;
        registry.register(Box::new(dns_queries.clone()))?;
        registry.register(Box::new(dns_cache_hits.clone()))?;
        registry.register(Box::new(dns_blocked.clone()))?;

        Ok(Self {
            registry,
            dhcp_req_time,
            dns_req_time,
            dhcp_ops,
            dns_queries,
            dns_cache_hits,
            dns_blocked,
        })
    }

    /// Text exposition format for the admin endpoint.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}
