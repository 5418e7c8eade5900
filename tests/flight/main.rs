mod common;

mod anomaly;
mod epoch;
mod handshake;
mod key_update;
mod reorder;
mod retransmit;
