use rdkafka::ClientConfig;

/// Builds the librdkafka configuration for the subscriber's group consumer.
///
/// Offsets are always stored explicitly through `mark_consumed`, so
/// `enable.auto.offset.store` stays off whatever the commit mode.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Let librdkafka commit stored offsets in the background every
    /// `interval_ms`. Left disabled otherwise.
    pub fn with_auto_commit(mut self, enabled: bool, interval_ms: u32) -> Self {
        if enabled {
            self.config
                .set("enable.auto.commit", "true")
                .set("auto.commit.interval.ms", interval_ms.to_string());
        }
        self
    }

    /// Use the cooperative-sticky strategy, and static membership when a
    /// client id is supplied.
    pub fn with_sticky_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        self.config
            .set("partition.assignment.strategy", "cooperative-sticky");

        if let Some(client_id) = client_id {
            self.config.set("client.id", client_id);
            self.config.set("group.instance.id", client_id);
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
