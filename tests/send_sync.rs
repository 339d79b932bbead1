//! Send/Sync guarantees for core types.

use femtoforward::{
    Acceptor, ForwardConfig, ForwardOutput, ForwardOutputBuilder, Node, NodeSelector,
    PhiFailureDetector, ServerBuilder, ack::AckTable,
};
use rstest::rstest;
use static_assertions::assert_impl_all;

#[rstest]
fn builders_are_send_sync() {
    assert_impl_all!(ForwardOutputBuilder: Send, Sync);
    assert_impl_all!(ServerBuilder: Send, Sync);
    assert_impl_all!(ForwardConfig: Send, Sync);
}

#[rstest]
fn components_are_send_sync() {
    assert_impl_all!(ForwardOutput: Send, Sync);
    assert_impl_all!(Node: Send, Sync);
    assert_impl_all!(NodeSelector: Send, Sync);
    assert_impl_all!(AckTable: Send, Sync);
    assert_impl_all!(PhiFailureDetector: Send, Sync);
    assert_impl_all!(Acceptor: Send, Sync);
}
