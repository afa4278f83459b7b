/// Sizing limits shared by all layers of the stack.
///
/// The standard profile matches full-size deployments; the constrained
/// profile halves the frame budget and shrinks windows and ring buffers for
/// memory-starved targets. Components take [`Limits::STANDARD`] unless an
/// explicit profile is passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum total frame length (header included), in bytes.
    pub max_frame_size: usize,
    /// Maximum reliable-delivery window, in frames. Never exceeds 32 - the
    /// pending masks are 32 bits wide.
    pub max_window_size: u8,
    /// Default byte ring buffer size.
    pub ringbuf_size: usize,
}

impl Limits {
    pub const STANDARD: Limits = Limits {
        max_frame_size: 1024,
        max_window_size: 16,
        ringbuf_size: 2048,
    };

    pub const CONSTRAINED: Limits = Limits {
        max_frame_size: 256,
        max_window_size: 4,
        ringbuf_size: 512,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Limits::STANDARD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        assert_eq!(Limits::default(), Limits::STANDARD);
        assert!(Limits::CONSTRAINED.max_frame_size < Limits::STANDARD.max_frame_size);
        assert!(Limits::STANDARD.max_window_size <= 32);
        assert!(Limits::CONSTRAINED.max_window_size <= 32);
    }
}
