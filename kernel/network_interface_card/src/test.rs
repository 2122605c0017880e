extern crate std;
extern crate alloc;

use super::*;
use alloc::string::ToString;
use alloc::vec;

#[test]
fn link_state_display() {
    assert_eq!(LinkState::DOWN.to_string(), "down");
    assert_eq!(LinkState::up(Speed::Mbps1000, Duplex::Full).to_string(), "up, 1000Mbps full-duplex");
    assert!(!LinkState::DOWN.up);
}

#[test]
fn submit_error_returns_the_frame() {
    let err = SubmitError::new(TransmitError::ResourceExhausted, TransmitFrame::new(42, vec![1, 2, 3]));
    assert_eq!(err.to_string(), "frame 42: not enough free transmit descriptors");
    assert_eq!(err.frame.head, vec![1, 2, 3]);
}
