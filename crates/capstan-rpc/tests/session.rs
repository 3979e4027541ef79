//! End-to-end session tests over the in-memory transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::{FrameParser, Message, StructSize, Transport};
use capstan_rpc::wire;
use capstan_rpc::{
    Capability, CapabilityServer, Payload, PayloadBuilder, Request, Restorer, RpcError,
    TransformOp, Vat, VatOptions,
};
use capstan_transport_mem::MemTransport;
use futures::future::BoxFuture;
use parking_lot::Mutex;

const ECHO_INTERFACE: u64 = 0xec0;
const GATE_INTERFACE: u64 = 0xa7e;

/// Adds one to the u64 at the start of the params.
struct EchoImpl;

impl CapabilityServer for EchoImpl {
    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>> {
        Box::pin(async move {
            let value = params.message.read_struct_data(params.root, 0, 64, 0)?;
            let mut out = PayloadBuilder::new(StructSize::new(1, 0))?;
            let root = out.root;
            out.message.write_struct_data(root, 0, 64, value + 1)?;
            Ok(out.finish())
        })
    }
}

/// Hands out a configured capability after a delay.
struct GateImpl {
    service: Capability,
    delay: Duration,
}

impl CapabilityServer for GateImpl {
    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>> {
        let service = self.service.clone();
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let mut out = PayloadBuilder::new(StructSize::new(0, 1))?;
            out.set_cap(0, service)?;
            Ok(out.finish())
        })
    }
}

/// Never completes.
struct NeverImpl;

impl CapabilityServer for NeverImpl {
    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>> {
        Box::pin(futures::future::pending())
    }
}

#[derive(Default)]
struct MapRestorer {
    entries: Mutex<HashMap<String, Arc<dyn CapabilityServer>>>,
}

impl Restorer for MapRestorer {
    fn restore(&self, object_id: &str) -> Result<Arc<dyn CapabilityServer>, RpcError> {
        self.entries
            .lock()
            .get(object_id)
            .cloned()
            .ok_or(RpcError::UnknownCapability { id: 0 })
    }
}

fn echo_request(value: u64) -> Request {
    let mut request = Request::new(ECHO_INTERFACE, 0, StructSize::new(1, 0)).unwrap();
    let root = request.params.root;
    request
        .params
        .message
        .write_struct_data(root, 0, 64, value)
        .unwrap();
    request
}

fn connect() -> (Vat, Vat, Arc<MapRestorer>) {
    let (client_side, server_side) = MemTransport::pair();
    let restorer = Arc::new(MapRestorer::default());
    let client = Vat::spawn(client_side, VatOptions::default());
    let server = Vat::spawn(
        server_side,
        VatOptions {
            restorer: Some(restorer.clone()),
            ..VatOptions::default()
        },
    );
    (client, server, restorer)
}

async fn wait_until(vat: &Vat, what: &str, cond: impl Fn(&capstan_rpc::VatStats) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stats = vat.stats().await.unwrap();
        if cond(&stats) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}; last stats: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn restore_then_echo() {
    let (client, _server, restorer) = connect();
    restorer
        .entries
        .lock()
        .insert("echo".into(), Arc::new(EchoImpl));

    let mut restore = client.import_capability("echo").await.unwrap();
    let echo = restore
        .wait(Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .capability()
        .unwrap();
    assert!(matches!(echo, Capability::Remote { .. }));

    let mut answer = client.send(echo, echo_request(41)).await.unwrap();
    let results = answer.wait(Some(Duration::from_secs(2))).await.unwrap();
    let value = results
        .message
        .read_struct_data(results.root, 0, 64, 0)
        .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn unknown_restore_object_is_an_error() {
    let (client, _server, _restorer) = connect();
    let mut restore = client.import_capability("missing").await.unwrap();
    let err = restore
        .wait(Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote { .. }), "got {err:?}");
}

#[tokio::test]
async fn stale_import_reports_unknown_capability() {
    let (client, _server, _restorer) = connect();
    let mut answer = client
        .send(Capability::Remote { id: 404 }, echo_request(0))
        .await
        .unwrap();
    let err = answer.wait(Some(Duration::from_secs(2))).await.unwrap_err();
    let RpcError::Remote { reason } = err else {
        panic!("expected a remote exception, got {err:?}");
    };
    assert!(reason.contains("unknown capability"), "reason: {reason}");
}

#[tokio::test]
async fn local_dispatch_needs_no_network() {
    let (client, _server, _restorer) = connect();
    let echo = client.export_object(Arc::new(EchoImpl)).await.unwrap();

    let mut answer = client.send(echo, echo_request(7)).await.unwrap();
    let results = answer.wait(Some(Duration::from_secs(2))).await.unwrap();
    let value = results
        .message
        .read_struct_data(results.root, 0, 64, 0)
        .unwrap();
    assert_eq!(value, 8);

    drop(answer);
    drop(results);
    wait_until(&client, "questions to drain", |s| s.questions == 0).await;
}

#[tokio::test]
async fn pipeline_on_a_local_promise() {
    let (client, _server, _restorer) = connect();
    let echo = client.export_object(Arc::new(EchoImpl)).await.unwrap();
    let gate = client
        .export_object(Arc::new(GateImpl {
            service: echo,
            delay: Duration::from_millis(25),
        }))
        .await
        .unwrap();

    // The gate has not resolved when the pipelined call is issued.
    let open = client
        .send(gate, Request::new(GATE_INTERFACE, 0, StructSize::new(0, 0)).unwrap())
        .await
        .unwrap();
    let promised_echo = open.pipeline(vec![TransformOp::GetPointerField(0)]);
    let mut answer = client.send(promised_echo, echo_request(10)).await.unwrap();
    let results = answer.wait(Some(Duration::from_secs(2))).await.unwrap();
    let value = results
        .message
        .read_struct_data(results.root, 0, 64, 0)
        .unwrap();
    assert_eq!(value, 11);
}

#[tokio::test]
async fn cancel_before_return_clears_the_answer() {
    let (client, server, restorer) = connect();
    restorer
        .entries
        .lock()
        .insert("never".into(), Arc::new(NeverImpl));

    let mut restore = client.import_capability("never").await.unwrap();
    let never = restore
        .wait(Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .capability()
        .unwrap();

    // The restore answer occupies one slot; the call adds a second.
    let answer = client.send(never, echo_request(0)).await.unwrap();
    wait_until(&server, "the call to land", |s| s.answers == 2).await;

    // Dropping the handle cancels: finish reaches the peer, which forgets
    // the answer even though the worker never completed.
    drop(answer);
    wait_until(&server, "the answer to be forgotten", |s| s.answers == 1).await;
}

#[tokio::test]
async fn wait_timeout_keeps_the_question() {
    let (client, _server, restorer) = connect();
    restorer
        .entries
        .lock()
        .insert("never".into(), Arc::new(NeverImpl));

    let mut restore = client.import_capability("never").await.unwrap();
    let never = restore
        .wait(Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .capability()
        .unwrap();

    let mut answer = client.send(never, echo_request(0)).await.unwrap();
    let err = answer
        .wait(Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::WaitTimeout));

    // The question is still outstanding; waiting again still times out
    // rather than failing with a missing question.
    let err = answer
        .wait(Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::WaitTimeout));
    let stats = client.stats().await.unwrap();
    assert!(stats.questions >= 1);
}

/// Drive a vat from a hand-rolled peer to check protocol-level behavior.
#[tokio::test]
async fn unsupported_messages_are_echoed_unimplemented() {
    let (vat_side, raw) = MemTransport::pair();
    let _vat = Vat::spawn(vat_side, VatOptions::default());

    // A `resolve` message, which this level does not handle.
    let mut msg = Message::new();
    let root = msg.init_root(StructSize::new(1, 1)).unwrap();
    msg.write_struct_data(root, 0, 16, wire::tag::RESOLVE as u64)
        .unwrap();
    raw.send(capstan_core::write_message(msg.segments()))
        .await
        .unwrap();

    let bytes = raw.recv().await.unwrap();
    let mut parser = FrameParser::new();
    parser.feed(&bytes);
    let segments = parser.next_message().unwrap().unwrap();
    let reply = Message::from_segments(segments).unwrap();
    let decoded = wire::decode_message(&reply).unwrap();
    assert!(
        matches!(decoded, wire::WireMessage::Unimplemented { .. }),
        "got {decoded:?}"
    );
}

#[tokio::test]
async fn restore_without_restorer_returns_exception() {
    let (vat_side, raw) = MemTransport::pair();
    let _vat = Vat::spawn(vat_side, VatOptions::default());

    let restore = wire::encode_restore(0, "anything").unwrap();
    raw.send(capstan_core::write_message(restore.segments()))
        .await
        .unwrap();

    let bytes = raw.recv().await.unwrap();
    let mut parser = FrameParser::new();
    parser.feed(&bytes);
    let reply = Message::from_segments(parser.next_message().unwrap().unwrap()).unwrap();
    let wire::WireMessage::Return(ret) = wire::decode_message(&reply).unwrap() else {
        panic!("expected a return");
    };
    assert_eq!(ret.answer_id, 0);
    assert!(matches!(ret.body, wire::ReturnBody::Exception { .. }));
}
