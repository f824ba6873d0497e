/// Caps on the amount of data the parser will buffer or forward without a
/// boundary or terminator in sight.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum bytes of preamble buffered before the first boundary.
    pub preamble_max: usize,
    /// Maximum bytes scanned after a boundary line looking for its
    /// terminating CRLF.
    pub boundary_line_scratch_max: usize,
    /// Maximum bytes of epilogue forwarded after the closing boundary.
    pub epilogue_max: u64,
    /// Maximum bytes of a single part's body, if capped at all.
    pub part_body_max: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            preamble_max: 8192,
            boundary_line_scratch_max: 8192,
            epilogue_max: i32::MAX as u64,
            part_body_max: None,
        }
    }
}

/// Tunable knobs for a parse run: size limits plus the backpressure depth of
/// the channels the event producer uses to hand data to its consumer.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub limits: Limits,
    /// Depth of the top-level preamble/part/epilogue event queue.
    pub event_queue_capacity: usize,
    /// Depth of each part's body byte-chunk channel.
    pub body_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            limits: Limits::default(),
            event_queue_capacity: 1,
            body_channel_capacity: 4,
        }
    }
}
