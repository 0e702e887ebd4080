//! Master/worker connection dispatch: FD-passing transport (C1), per-worker
//! control channel (C2), worker selection and backpressure (C3), and the
//! worker-side inbound connection pipeline (C4).

pub mod control_channel;
pub mod dispatcher;
pub mod fd_transport;
pub mod worker_inbound;

pub use control_channel::{QueuedFd, RecvStatusOutcome, WorkerSlot};
pub use dispatcher::{AcceptState, Dispatcher};
pub use fd_transport::{recv_fd, send_fd, RecvOutcome, SendOutcome};
pub use worker_inbound::{
    build_connection, report, try_receive, ConnectionTag, InboundConnection, WorkerReport,
    SENTINEL_PEER_ADDR,
};
