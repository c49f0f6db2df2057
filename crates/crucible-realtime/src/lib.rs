// Realtime Hub: accepts authenticated subscriber connections, joins them
// to org-scoped rooms, and fans out updates received via the Producer's
// trusted internal publish path to the matching room only.

mod hub;
mod websocket;

pub use hub::{RealtimeHub, Room, RoomEvent};
pub use websocket::{ws_realtime_handler, RealtimeState};
