use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;

/// Engine configuration consumed by `serve` and `connect`.
#[derive(Clone, Default)]
pub struct Options {
    /// Run one worker reactor per core instead of a single worker.
    pub multicore: bool,
    /// Bind with SO_REUSEPORT; every worker then owns its own listener and
    /// accepts locally.
    pub reuse_port: bool,
    /// Run the periodic tick callback on reactor 0.
    pub ticker: bool,
    /// SO_KEEPALIVE duration applied to accepted TCP connections.
    pub tcp_keep_alive: Option<Duration>,
    /// Framing codec; defaults to the pass-through codec.
    pub codec: Option<Arc<dyn Codec>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_multicore(mut self, multicore: bool) -> Self {
        self.multicore = multicore;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_ticker(mut self, ticker: bool) -> Self {
        self.ticker = ticker;
        self
    }

    pub fn with_tcp_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.tcp_keep_alive = Some(keep_alive);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }
}
