use tracing::*;

pub const FENCE_FLAG_BLOCK_BEFORE: u32 = 1 << 0;
pub const FENCE_FLAG_BLOCK_AFTER: u32 = 1 << 1;
pub const FENCE_FLAG_SYNC_NEXT: u32 = 1 << 2;
pub const FENCE_FLAG_REQUEST: u32 = 1 << 31;
pub const FENCE_FLAGS_SUPPORTED: u32 =
    FENCE_FLAG_BLOCK_BEFORE | FENCE_FLAG_BLOCK_AFTER | FENCE_FLAG_SYNC_NEXT | FENCE_FLAG_REQUEST;

pub const MAX_FENCE_PAYLOAD: usize = 64;

const PAYLOAD_HANDSHAKE: u8 = 0;
const PAYLOAD_PING: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl Fence {
    pub fn new(flags: u32, payload: Vec<u8>) -> Self {
        Self { flags, payload }
    }

    /// Sent once the client announces fence support
    pub fn handshake() -> Self {
        Self::new(FENCE_FLAG_REQUEST, vec![PAYLOAD_HANDSHAKE])
    }

    /// Round trip probe, old updates must be processed before it comes back
    pub fn ping() -> Self {
        Self::new(
            FENCE_FLAG_REQUEST | FENCE_FLAG_BLOCK_BEFORE,
            vec![PAYLOAD_PING],
        )
    }

    pub fn is_request(&self) -> bool {
        self.flags & FENCE_FLAG_REQUEST != 0
    }
}

/// What the connection should do with a fence from the client
#[derive(Debug, PartialEq, Eq)]
pub enum FenceAction {
    /// Answer right away
    Echo(Fence),
    /// Answered once the current batch of messages is done. A sync fence
    /// that was still waiting is handed back and must be answered now.
    Deferred(Option<Fence>),
    /// The answer to one of our round trip probes
    Pong,
    Ignored,
}

/// Client fence bookkeeping of one connection
#[derive(Debug, Default)]
pub struct FenceState {
    pending_sync: Option<Fence>,
}

impl FenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&mut self, fence: Fence) -> FenceAction {
        if fence.is_request() {
            if fence.flags & FENCE_FLAG_SYNC_NEXT != 0 {
                let flags = fence.flags
                    & (FENCE_FLAG_BLOCK_BEFORE | FENCE_FLAG_BLOCK_AFTER | FENCE_FLAG_SYNC_NEXT);
                let previous = self.pending_sync.replace(Fence::new(flags, fence.payload));
                return FenceAction::Deferred(previous);
            }

            // messages are handled in order, so both block modes hold trivially
            let flags = fence.flags & (FENCE_FLAG_BLOCK_BEFORE | FENCE_FLAG_BLOCK_AFTER);
            return FenceAction::Echo(Fence::new(flags, fence.payload));
        }

        match fence.payload.first() {
            None => {
                warn!("Fence response of unexpected size received");
                FenceAction::Ignored
            }
            Some(&PAYLOAD_HANDSHAKE) => FenceAction::Ignored,
            Some(&PAYLOAD_PING) => FenceAction::Pong,
            Some(other) => {
                warn!("Fence response of unexpected type {} received", other);
                FenceAction::Ignored
            }
        }
    }

    /// A sync fence is waiting, nothing may be sent before it is answered
    pub fn sync_pending(&self) -> bool {
        self.pending_sync.is_some()
    }

    pub fn take_pending(&mut self) -> Option<Fence> {
        self.pending_sync.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_request_is_echoed() {
        let mut state = FenceState::new();
        let action = state.received(Fence::new(
            FENCE_FLAG_REQUEST | FENCE_FLAG_BLOCK_AFTER,
            b"abc".to_vec(),
        ));
        assert_eq!(
            action,
            FenceAction::Echo(Fence::new(FENCE_FLAG_BLOCK_AFTER, b"abc".to_vec()))
        );
        assert!(!state.sync_pending());
    }

    #[test]
    fn sync_next_is_deferred() {
        let mut state = FenceState::new();
        let flags = FENCE_FLAG_REQUEST | FENCE_FLAG_BLOCK_BEFORE | FENCE_FLAG_SYNC_NEXT;
        assert_eq!(
            state.received(Fence::new(flags, vec![7])),
            FenceAction::Deferred(None)
        );
        assert!(state.sync_pending());

        // a second one pushes the first out
        let second = state.received(Fence::new(FENCE_FLAG_REQUEST | FENCE_FLAG_SYNC_NEXT, vec![8]));
        assert_eq!(
            second,
            FenceAction::Deferred(Some(Fence::new(
                FENCE_FLAG_BLOCK_BEFORE | FENCE_FLAG_SYNC_NEXT,
                vec![7]
            )))
        );
        assert_eq!(
            state.take_pending(),
            Some(Fence::new(FENCE_FLAG_SYNC_NEXT, vec![8]))
        );
        assert!(!state.sync_pending());
    }

    #[test]
    fn responses_by_payload() {
        let mut state = FenceState::new();
        assert_eq!(state.received(Fence::new(0, vec![1])), FenceAction::Pong);
        assert_eq!(state.received(Fence::new(0, vec![0])), FenceAction::Ignored);
        assert_eq!(state.received(Fence::new(0, vec![9])), FenceAction::Ignored);
        assert_eq!(state.received(Fence::new(0, vec![])), FenceAction::Ignored);
        assert_eq!(Fence::ping().flags, FENCE_FLAG_REQUEST | FENCE_FLAG_BLOCK_BEFORE);
    }
}
