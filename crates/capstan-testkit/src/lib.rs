//! capstan-testkit: conformance scenarios for capstan transports.
//!
//! Provides a `TransportFactory` trait and shared session scenarios that
//! every transport must pass.
//!
//! # Usage
//!
//! Each transport crate implements `TransportFactory` and runs the shared
//! scenarios:
//!
//! ```ignore
//! use capstan_testkit::{TransportFactory, TestError};
//!
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     type Transport = MyTransport;
//!
//!     async fn connect_pair() -> Result<(MyTransport, MyTransport), TestError> {
//!         /* create a connected pair */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn restore_and_call() {
//!     capstan_testkit::run_restore_and_call::<MyFactory>().await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::{
    FieldDescriptor, FieldSlot, NodeKind, Object, ObjectBuilder, SchemaNode, StructSize,
    Transport,
};
use capstan_rpc::{
    Capability, CapabilityServer, Payload, PayloadBuilder, PendingQuestion, Request, Restorer,
    RpcError, TransformOp, Vat, VatOptions, VatStats,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Transport creation failed.
    Setup(String),
    /// RPC call failed.
    Rpc(RpcError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Rpc(e) => write!(f, "RPC error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

/// Factory trait for creating transport pairs for testing.
pub trait TransportFactory: Send + Sync + 'static {
    /// The transport type being tested.
    type Transport: Transport + 'static;

    /// Create a connected pair of transports.
    fn connect_pair(
    ) -> impl Future<Output = Result<(Self::Transport, Self::Transport), TestError>> + Send;
}

// ============================================================================
// Test services
// ============================================================================

pub const ADDER_INTERFACE_ID: u64 = 0x9fd1_77d8_8b0f_a001;
pub const REGISTRY_INTERFACE_ID: u64 = 0x9fd1_77d8_8b0f_a002;
pub const SINK_INTERFACE_ID: u64 = 0x9fd1_77d8_8b0f_a003;

const ADD_PARAMS_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor {
        name: "a",
        slot: FieldSlot::Data { bit_align: 0, bit_len: 32, default: 0 },
    },
    FieldDescriptor {
        name: "b",
        slot: FieldSlot::Data { bit_align: 32, bit_len: 32, default: 0 },
    },
];

const ADD_RESULTS_FIELDS: &[FieldDescriptor] = &[FieldDescriptor {
    name: "sum",
    slot: FieldSlot::Data { bit_align: 0, bit_len: 32, default: 0 },
}];

pub const ADD_PARAMS: SchemaNode = SchemaNode {
    id: 0x1,
    name: "AddParams",
    kind: NodeKind::Struct { size: StructSize::new(1, 0), fields: ADD_PARAMS_FIELDS },
};

pub const ADD_RESULTS: SchemaNode = SchemaNode {
    id: 0x2,
    name: "AddResults",
    kind: NodeKind::Struct { size: StructSize::new(1, 0), fields: ADD_RESULTS_FIELDS },
};

/// Arithmetic service used by most scenarios.
pub struct AdderImpl;

impl CapabilityServer for AdderImpl {
    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>> {
        Box::pin(async move {
            if interface_id != ADDER_INTERFACE_ID || method_id != 0 {
                return Err(RpcError::Unimplemented);
            }
            let view = Object::new(&params.message, params.root, &ADD_PARAMS);
            let a = view.get_data("a")?;
            let b = view.get_data("b")?;

            let mut results = PayloadBuilder::new(StructSize::new(1, 0))?;
            let root = results.root;
            let mut builder = ObjectBuilder::new(&mut results.message, root, &ADD_RESULTS);
            builder.set_data("sum", a.wrapping_add(b))?;
            Ok(results.finish())
        })
    }
}

/// Hands out capabilities: `get` (method 0) returns the configured service
/// after an optional delay, `pair` (method 1) returns it twice.
pub struct RegistryImpl {
    pub service: Capability,
    pub delay: Option<Duration>,
}

impl CapabilityServer for RegistryImpl {
    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        _params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>> {
        let service = self.service.clone();
        let delay = self.delay;
        Box::pin(async move {
            if interface_id != REGISTRY_INTERFACE_ID {
                return Err(RpcError::Unimplemented);
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match method_id {
                0 => {
                    let mut results = PayloadBuilder::new(StructSize::new(0, 1))?;
                    results.set_cap(0, service)?;
                    Ok(results.finish())
                }
                1 => {
                    let mut results = PayloadBuilder::new(StructSize::new(0, 2))?;
                    results.set_cap(0, service.clone())?;
                    results.set_cap(1, service)?;
                    Ok(results.finish())
                }
                _ => Err(RpcError::Unimplemented),
            }
        })
    }
}

/// Accepts capabilities in params and discards them.
pub struct SinkImpl;

impl CapabilityServer for SinkImpl {
    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>> {
        Box::pin(async { Ok(Payload::empty()) })
    }
}

/// Never completes; used to leave questions outstanding.
pub struct NeverImpl;

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

/// A restorer backed by a name → object map, fillable after the vat is
/// spawned.
#[derive(Default)]
pub struct MapRestorer {
    entries: Mutex<HashMap<String, Arc<dyn CapabilityServer>>>,
}

impl MapRestorer {
    pub fn new() -> Arc<MapRestorer> {
        Arc::new(MapRestorer::default())
    }

    pub fn insert(&self, name: &str, server: Arc<dyn CapabilityServer>) {
        self.entries.lock().insert(name.to_string(), server);
    }
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

// ============================================================================
// Scenario plumbing
// ============================================================================

/// A connected pair of vats with a map restorer on the server side.
pub struct SessionPair {
    pub client: Vat,
    pub server: Vat,
    pub restorer: Arc<MapRestorer>,
}

pub async fn connect<F: TransportFactory>() -> Result<SessionPair, TestError> {
    let (client_transport, server_transport) = F::connect_pair().await?;
    let restorer = MapRestorer::new();
    let client = Vat::spawn(client_transport, VatOptions::default());
    let server = Vat::spawn(
        server_transport,
        VatOptions {
            restorer: Some(restorer.clone()),
            ..VatOptions::default()
        },
    );
    Ok(SessionPair { client, server, restorer })
}

/// Build an `add(a, b)` request.
pub fn add_request(a: u32, b: u32) -> Result<Request, TestError> {
    let mut request = Request::new(ADDER_INTERFACE_ID, 0, StructSize::new(1, 0))
        .map_err(TestError::Rpc)?;
    let root = request.params.root;
    let mut builder = ObjectBuilder::new(&mut request.params.message, root, &ADD_PARAMS);
    builder.set_data("a", a as u64).map_err(|e| TestError::Rpc(RpcError::from(e)))?;
    builder.set_data("b", b as u64).map_err(|e| TestError::Rpc(RpcError::from(e)))?;
    Ok(request)
}

/// Read the `sum` field out of add results.
pub fn read_sum(results: &Payload) -> Result<u64, TestError> {
    let view = Object::new(&results.message, results.root, &ADD_RESULTS);
    view.get_data("sum").map_err(|e| TestError::Rpc(RpcError::from(e)))
}

async fn wait_for_stats(
    vat: &Vat,
    what: &str,
    cond: impl Fn(&VatStats) -> bool,
) -> Result<(), TestError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stats = vat.stats().await.map_err(TestError::Rpc)?;
        if cond(&stats) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TestError::Assertion(format!(
                "timed out waiting for {what}; last stats: {stats:?}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_payload(q: &mut PendingQuestion) -> Result<Payload, TestError> {
    q.wait(Some(Duration::from_secs(2))).await.map_err(TestError::Rpc)
}

// ============================================================================
// Scenarios
// ============================================================================

/// Restore a named capability and make a unary call on it.
pub async fn run_restore_and_call<F: TransportFactory>() {
    if let Err(e) = restore_and_call_inner::<F>().await {
        panic!("run_restore_and_call failed: {}", e);
    }
}

async fn restore_and_call_inner<F: TransportFactory>() -> Result<(), TestError> {
    let pair = connect::<F>().await?;
    pair.restorer.insert("adder", Arc::new(AdderImpl));

    let mut restore = pair.client.import_capability("adder").await?;
    let adder = wait_payload(&mut restore).await?.capability()?;

    for (a, b, expected) in [(2u32, 3u32, 5u64), (10, 20, 30), (0, 0, 0)] {
        let mut answer = pair.client.send(adder.clone(), add_request(a, b)?).await?;
        let results = wait_payload(&mut answer).await?;
        let sum = read_sum(&results)?;
        if sum != expected {
            return Err(TestError::Assertion(format!(
                "expected add({a}, {b}) = {expected}, got {sum}"
            )));
        }
    }
    Ok(())
}

/// Sharing the same local capability twice in one payload produces one
/// export entry with a reference count of two.
pub async fn run_export_dedup<F: TransportFactory>() {
    if let Err(e) = export_dedup_inner::<F>().await {
        panic!("run_export_dedup failed: {}", e);
    }
}

async fn export_dedup_inner<F: TransportFactory>() -> Result<(), TestError> {
    let pair = connect::<F>().await?;
    pair.restorer.insert("sink", Arc::new(SinkImpl));

    let mut restore = pair.client.import_capability("sink").await?;
    let sink = wait_payload(&mut restore).await?.capability()?;

    let local = pair.client.export_object(Arc::new(AdderImpl)).await?;
    let mut request = Request::new(SINK_INTERFACE_ID, 0, StructSize::new(0, 2))
        .map_err(TestError::Rpc)?;
    request.params.set_cap(0, local.clone()).map_err(TestError::Rpc)?;
    request.params.set_cap(1, local).map_err(TestError::Rpc)?;

    let mut answer = pair.client.send(sink, request).await?;
    wait_payload(&mut answer).await?;

    let stats = pair.client.stats().await.map_err(TestError::Rpc)?;
    match stats.exports.as_slice() {
        [(_, 2)] => Ok(()),
        other => Err(TestError::Assertion(format!(
            "expected one export with refcount 2, got {other:?}"
        ))),
    }
}

/// Finishing a question whose return carried capabilities drops their
/// import refcounts to zero on the caller and the export entries on the
/// callee.
pub async fn run_release_on_finish<F: TransportFactory>() {
    if let Err(e) = release_on_finish_inner::<F>().await {
        panic!("run_release_on_finish failed: {}", e);
    }
}

async fn release_on_finish_inner<F: TransportFactory>() -> Result<(), TestError> {
    let pair = connect::<F>().await?;
    let adder = pair.server.export_object(Arc::new(AdderImpl)).await?;
    pair.restorer.insert(
        "registry",
        Arc::new(RegistryImpl { service: adder, delay: None }),
    );

    let mut restore = pair.client.import_capability("registry").await?;
    let registry = wait_payload(&mut restore).await?.capability()?;

    // `pair` returns the same capability at two result slots.
    let request =
        Request::new(REGISTRY_INTERFACE_ID, 1, StructSize::new(0, 0)).map_err(TestError::Rpc)?;
    let mut answer = pair.client.send(registry, request).await?;
    let results = wait_payload(&mut answer).await?;
    let first = results.cap_at(0).map_err(TestError::Rpc)?;
    let second = results.cap_at(1).map_err(TestError::Rpc)?;
    if first != second {
        return Err(TestError::Assertion(format!(
            "expected deduplicated result caps, got {first:?} and {second:?}"
        )));
    }
    let Capability::Remote { id: adder_import } = first else {
        return Err(TestError::Assertion(format!(
            "expected a remote capability, got {first:?}"
        )));
    };
    let stats = pair.client.stats().await.map_err(TestError::Rpc)?;
    if !stats.imports.contains(&(adder_import, 2)) {
        return Err(TestError::Assertion(format!(
            "expected two import refs before finish, got {:?}",
            stats.imports
        )));
    }

    // Dropping the handle sends finish with releaseResultCaps; both refs
    // drop and the entry disappears. The registry's own import survives.
    drop(answer);
    drop(results);
    wait_for_stats(&pair.client, "adder import to drain", |s| {
        s.imports.iter().all(|(id, _)| *id != adder_import)
    })
    .await?;
    wait_for_stats(&pair.server, "adder export to drop", |s| s.exports.len() == 1).await?;
    Ok(())
}

/// Calls pipelined onto an unresolved answer run once it resolves, without
/// an intervening wait.
pub async fn run_pipelined_call<F: TransportFactory>() {
    if let Err(e) = pipelined_call_inner::<F>().await {
        panic!("run_pipelined_call failed: {}", e);
    }
}

async fn pipelined_call_inner<F: TransportFactory>() -> Result<(), TestError> {
    let pair = connect::<F>().await?;
    let adder = pair.server.export_object(Arc::new(AdderImpl)).await?;
    pair.restorer.insert(
        "registry",
        Arc::new(RegistryImpl {
            service: adder,
            delay: Some(Duration::from_millis(25)),
        }),
    );

    // Three hops deep with no waits: restore → get → add.
    let restore = pair.client.import_capability("registry").await?;
    let registry_promise = restore.pipeline(Vec::new());

    let get_request =
        Request::new(REGISTRY_INTERFACE_ID, 0, StructSize::new(0, 0)).map_err(TestError::Rpc)?;
    let get_answer = pair.client.send(registry_promise, get_request).await?;
    let adder_promise = get_answer.pipeline(vec![TransformOp::GetPointerField(0)]);

    let mut answer = pair.client.send(adder_promise, add_request(2, 3)?).await?;
    let sum = read_sum(&wait_payload(&mut answer).await?)?;
    if sum != 5 {
        return Err(TestError::Assertion(format!(
            "expected pipelined add(2, 3) = 5, got {sum}"
        )));
    }
    Ok(())
}

/// Stopping a vat fails every outstanding question.
pub async fn run_stop_fails_outstanding<F: TransportFactory>() {
    if let Err(e) = stop_fails_outstanding_inner::<F>().await {
        panic!("run_stop_fails_outstanding failed: {}", e);
    }
}

async fn stop_fails_outstanding_inner<F: TransportFactory>() -> Result<(), TestError> {
    let pair = connect::<F>().await?;
    pair.restorer.insert("never", Arc::new(NeverImpl));

    let mut restore = pair.client.import_capability("never").await?;
    let never = wait_payload(&mut restore).await?.capability()?;

    let mut answer = pair
        .client
        .send(never, add_request(1, 1)?)
        .await?;
    pair.client.stop().await;

    match answer.wait(Some(Duration::from_secs(2))).await {
        Err(RpcError::Stopped) | Err(RpcError::TransportFailed(_)) => Ok(()),
        Ok(_) => Err(TestError::Assertion(
            "question resolved after stop".to_string(),
        )),
        Err(other) => Err(TestError::Assertion(format!(
            "expected Stopped, got {other:?}"
        ))),
    }
}
