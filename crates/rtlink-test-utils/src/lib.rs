// rtlink-test-utils: test doubles for the realtime connection subsystem.

mod mock_server;

pub use mock_server::{ConnectionRecord, MockRealtimeServer, ServerBehavior};
