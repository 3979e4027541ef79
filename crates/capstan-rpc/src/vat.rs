//! The vat: one RPC session over one transport.
//!
//! A single tokio task owns all four tables and serializes every mutation;
//! callers and method workers talk to it over a command channel, so the
//! session never blocks on user code. Inbound bytes run through the frame
//! parser; each complete message is decoded and routed by its union tag.
//!
//! Lifecycles:
//!
//! - question: open → fulfilled (return) → finished (handle dropped);
//!   a dropped handle before the return cancels with an early finish.
//! - answer: pending → ready (worker completion) → released (peer finish).
//! - export: positive refcount, bumped on outbound sharing, dropped by
//!   `release`; removed at zero.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::{FrameParser, Message, Transport};
use tokio::sync::{mpsc, oneshot};

use crate::capability::{Capability, PromiseVariant, TransformOp};
use crate::error::RpcError;
use crate::payload::{CapabilityServer, Payload, Request, Restorer};
use crate::tables::{
    AnswerId, AnswerState, AnswerTable, ExportTable, ImportTable, QuestionId, QuestionTable,
};
use crate::wire::{
    self, CapDescriptor, PayloadContent, ReturnBody, TargetMsg, WireMessage,
};

/// Session configuration.
pub struct VatOptions {
    /// Resolves inbound `restore` object ids.
    pub restorer: Option<Arc<dyn Restorer>>,
    /// Depth of the command channel between callers and the session task.
    pub command_depth: usize,
}

impl Default for VatOptions {
    fn default() -> VatOptions {
        VatOptions {
            restorer: None,
            command_depth: 64,
        }
    }
}

/// Table sizes and refcounts, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VatStats {
    pub questions: usize,
    pub answers: usize,
    pub exports: Vec<(u32, u32)>,
    pub imports: Vec<(u32, u32)>,
}

type ResultTx = oneshot::Sender<Result<Payload, RpcError>>;
type ResultRx = oneshot::Receiver<Result<Payload, RpcError>>;
type SendReply = oneshot::Sender<Result<(QuestionId, ResultRx), RpcError>>;

enum Command {
    Send {
        target: Capability,
        request: Request,
        reply: SendReply,
    },
    Restore {
        object_id: String,
        reply: SendReply,
    },
    Export {
        server: Arc<dyn CapabilityServer>,
        reply: oneshot::Sender<Capability>,
    },
    Stats {
        reply: oneshot::Sender<VatStats>,
    },
    QuestionDropped {
        id: QuestionId,
    },
    AnswerComplete {
        id: AnswerId,
        result: Result<Payload, RpcError>,
    },
    LocalComplete {
        id: QuestionId,
        result: Result<Payload, RpcError>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// A call parked on a promise: re-dispatched into question `id` once the
/// target resolves.
struct ParkedSend {
    id: QuestionId,
    request: Request,
    transform: Vec<TransformOp>,
}

/// An inbound call whose promised-answer target is still pending.
struct ParkedCall {
    answer_id: AnswerId,
    interface_id: u64,
    method_id: u16,
    transform: Vec<TransformOp>,
    params: Payload,
}

enum QuestionWaiter {
    Result(ResultTx),
    Pipelined(ParkedSend),
}

enum AnswerWaiter {
    InboundCall(ParkedCall),
    LocalSend(ParkedSend),
}

enum DispatchDone {
    Answer(AnswerId),
    Question(QuestionId),
}

/// Handle to an outstanding question.
///
/// Dropping the handle is the originator's death monitor: an unresolved
/// question is cancelled with an early finish, a resolved one is finished
/// normally.
pub struct PendingQuestion {
    id: QuestionId,
    rx: Option<ResultRx>,
    cmd: mpsc::Sender<Command>,
}

impl PendingQuestion {
    pub fn id(&self) -> QuestionId {
        self.id
    }

    /// Block until the question resolves. A timeout gives up waiting but
    /// does not rescind the question; call `wait` again to keep waiting.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<Payload, RpcError> {
        let rx = self.rx.as_mut().ok_or(RpcError::Stopped)?;
        let received = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, &mut *rx).await {
                Ok(received) => received,
                Err(_) => return Err(RpcError::WaitTimeout),
            },
        };
        self.rx = None;
        received.unwrap_or(Err(RpcError::Stopped))
    }

    /// A promise for part of this question's eventual result, usable as a
    /// call target before the result arrives.
    pub fn pipeline(&self, transform: Vec<TransformOp>) -> Capability {
        Capability::Promise {
            id: self.id,
            variant: PromiseVariant::Answer,
            transform,
        }
    }
}

impl Drop for PendingQuestion {
    fn drop(&mut self) {
        let _ = self.cmd.try_send(Command::QuestionDropped { id: self.id });
    }
}

/// One end of an RPC session.
pub struct Vat {
    cmd: mpsc::Sender<Command>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Vat {
    /// Spawn the session task over a transport.
    pub fn spawn<T: Transport + 'static>(transport: T, options: VatOptions) -> Vat {
        let (cmd_tx, cmd_rx) = mpsc::channel(options.command_depth);
        let session = Session {
            transport: Arc::new(transport),
            cmd_tx: cmd_tx.clone(),
            parser: FrameParser::new(),
            questions: QuestionTable::new(),
            answers: AnswerTable::new(),
            exports: ExportTable::new(),
            imports: ImportTable::new(),
            locals: HashMap::new(),
            next_local: 0,
            restorer: options.restorer,
            stopped: None,
        };
        let task = tokio::spawn(session.run(cmd_rx));
        Vat {
            cmd: cmd_tx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    async fn roundtrip(&self, make: impl FnOnce(SendReply) -> Command) -> Result<PendingQuestion, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(make(tx))
            .await
            .map_err(|_| RpcError::Stopped)?;
        let (id, result_rx) = rx.await.map_err(|_| RpcError::Stopped)??;
        Ok(PendingQuestion {
            id,
            rx: Some(result_rx),
            cmd: self.cmd.clone(),
        })
    }

    /// Send a call. The target may be local, remote, or an unresolved
    /// promise; promise targets pipeline rather than wait.
    pub async fn send(
        &self,
        target: Capability,
        request: Request,
    ) -> Result<PendingQuestion, RpcError> {
        self.roundtrip(|reply| Command::Send { target, request, reply }).await
    }

    /// Ask the peer to restore a named capability.
    pub async fn import_capability(&self, object_id: &str) -> Result<PendingQuestion, RpcError> {
        let object_id = object_id.to_string();
        self.roundtrip(|reply| Command::Restore { object_id, reply }).await
    }

    /// Register a local object and get a capability handle for it.
    pub async fn export_object(
        &self,
        server: Arc<dyn CapabilityServer>,
    ) -> Result<Capability, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::Export { server, reply: tx })
            .await
            .map_err(|_| RpcError::Stopped)?;
        rx.await.map_err(|_| RpcError::Stopped)
    }

    /// Current table sizes and refcounts.
    pub async fn stats(&self) -> Result<VatStats, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::Stats { reply: tx })
            .await
            .map_err(|_| RpcError::Stopped)?;
        rx.await.map_err(|_| RpcError::Stopped)
    }

    /// Terminate the session; every outstanding question fails.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(Command::Stop { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl Drop for Vat {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

struct Session<T: Transport> {
    transport: Arc<T>,
    cmd_tx: mpsc::Sender<Command>,
    parser: FrameParser,
    questions: QuestionTable<QuestionWaiter, Result<Payload, RpcError>>,
    answers: AnswerTable<AnswerWaiter, Result<Payload, RpcError>>,
    exports: ExportTable,
    imports: ImportTable,
    locals: HashMap<u64, Arc<dyn CapabilityServer>>,
    next_local: u64,
    restorer: Option<Arc<dyn Restorer>>,
    stopped: Option<RpcError>,
}

/// Walk a transform over a resolved payload down to a capability.
fn apply_transform(payload: &Payload, ops: &[TransformOp]) -> Result<Capability, RpcError> {
    let mut r = payload.root;
    for op in ops {
        match op {
            TransformOp::Noop => {}
            TransformOp::GetPointerField(idx) => {
                r = payload.message.read_struct_ptr(r, *idx)?;
            }
        }
    }
    match r.kind {
        capstan_core::RefKind::Interface { cap } => payload
            .caps
            .get(cap as usize)
            .cloned()
            .ok_or(RpcError::Protocol("cap index out of table range")),
        capstan_core::RefKind::Null => Err(RpcError::PromiseBroken {
            reason: "transform landed on a null pointer".into(),
        }),
        _ => Err(RpcError::Protocol("transform did not land on a capability")),
    }
}

impl<T: Transport + 'static> Session<T> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            let transport = Arc::clone(&self.transport);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Stop { reply }) => {
                        self.shutdown(RpcError::Stopped).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Every handle is gone; nothing can observe results.
                        self.shutdown(RpcError::Stopped).await;
                        break;
                    }
                },
                chunk = transport.recv() => match chunk {
                    Ok(bytes) => {
                        self.parser.feed(&bytes);
                        loop {
                            match self.parser.next_message() {
                                Ok(Some(segments)) => self.handle_frame(segments).await,
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(error = %e, "corrupt frame stream");
                                    self.shutdown(RpcError::TransportFailed(e.to_string()))
                                        .await;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        self.shutdown(RpcError::TransportFailed(e.to_string())).await;
                    }
                },
            }
            if self.stopped.is_some() {
                break;
            }
        }
        // Serve stragglers with the terminal error until handles drain.
        while let Some(cmd) = cmd_rx.recv().await {
            self.handle_command(cmd).await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { target, request, reply } => {
                if let Some(err) = &self.stopped {
                    let _ = reply.send(Err(err.clone()));
                    return;
                }
                let (id, rx) = self.begin_question();
                let _ = reply.send(Ok((id, rx)));
                self.dispatch_into(id, target, request).await;
            }
            Command::Restore { object_id, reply } => {
                if let Some(err) = &self.stopped {
                    let _ = reply.send(Err(err.clone()));
                    return;
                }
                let (id, rx) = self.begin_question();
                let _ = reply.send(Ok((id, rx)));
                if let Some(q) = self.questions.get_mut(id) {
                    q.local = false;
                }
                match wire::encode_restore(id, &object_id) {
                    Ok(msg) => {
                        let _ = self.send_message(&msg).await;
                    }
                    Err(e) => self.fulfill_question(id, Err(e)).await,
                }
            }
            Command::Export { server, reply } => {
                let id = self.register_local(server);
                let _ = reply.send(Capability::Local { id });
            }
            Command::Stats { reply } => {
                let _ = reply.send(VatStats {
                    questions: self.questions.len(),
                    answers: self.answers.len(),
                    exports: self.exports.refcounts(),
                    imports: self.imports.refcounts(),
                });
            }
            Command::QuestionDropped { id } => self.question_dropped(id).await,
            Command::AnswerComplete { id, result } => self.complete_answer(id, result).await,
            Command::LocalComplete { id, result } => self.fulfill_question(id, result).await,
            Command::Stop { reply } => {
                self.shutdown(RpcError::Stopped).await;
                let _ = reply.send(());
            }
        }
    }

    fn begin_question(&mut self) -> (QuestionId, ResultRx) {
        let id = self.questions.insert(true);
        let (tx, rx) = oneshot::channel();
        self.questions
            .get_mut(id)
            .expect("question just inserted")
            .waiters
            .push(QuestionWaiter::Result(tx));
        (id, rx)
    }

    fn register_local(&mut self, server: Arc<dyn CapabilityServer>) -> u64 {
        let id = self.next_local;
        self.next_local += 1;
        self.locals.insert(id, server);
        id
    }

    // -- outbound ----------------------------------------------------------

    /// Route a call into question `id`, resolving promise targets as far as
    /// current knowledge allows.
    async fn dispatch_into(&mut self, id: QuestionId, target: Capability, request: Request) {
        let mut target = target;
        loop {
            match target {
                Capability::Local { id: local_id } => {
                    match self.locals.get(&local_id).cloned() {
                        Some(server) => {
                            self.spawn_dispatch(
                                server,
                                request.interface_id,
                                request.method_id,
                                request.params.finish(),
                                DispatchDone::Question(id),
                            );
                        }
                        None => {
                            self.fulfill_question(
                                id,
                                Err(RpcError::Protocol("dangling local capability")),
                            )
                            .await;
                        }
                    }
                    return;
                }
                Capability::Exported { id: export_id } => {
                    match self.exports.get(export_id).map(|e| e.cap.clone()) {
                        Some(cap @ Capability::Local { .. }) => {
                            target = cap;
                        }
                        Some(_) => {
                            self.fulfill_question(
                                id,
                                Err(RpcError::Protocol("export does not hold a local capability")),
                            )
                            .await;
                            return;
                        }
                        None => {
                            self.fulfill_question(
                                id,
                                Err(RpcError::UnknownCapability { id: export_id }),
                            )
                            .await;
                            return;
                        }
                    }
                }
                Capability::Remote { id: import_id }
                | Capability::Promise {
                    id: import_id,
                    variant: PromiseVariant::Remote | PromiseVariant::Resolve,
                    ..
                } => {
                    self.network_dispatch(id, TargetMsg::ImportedCap(import_id), request)
                        .await;
                    return;
                }
                Capability::Promise {
                    id: question_id,
                    variant: PromiseVariant::Answer,
                    transform,
                } => {
                    let Some(q) = self.questions.get(question_id) else {
                        self.fulfill_question(
                            id,
                            Err(RpcError::UnknownCapability { id: question_id }),
                        )
                        .await;
                        return;
                    };
                    match (&q.result, q.local) {
                        (Some(Ok(payload)), _) => {
                            let payload = payload.clone();
                            match apply_transform(&payload, &transform) {
                                Ok(cap) => target = cap,
                                Err(e) => {
                                    self.fulfill_question(id, Err(e)).await;
                                    return;
                                }
                            }
                        }
                        (Some(Err(e)), _) => {
                            let reason = e.to_string();
                            self.fulfill_question(
                                id,
                                Err(RpcError::PromiseBroken { reason }),
                            )
                            .await;
                            return;
                        }
                        (None, true) => {
                            // Pipeline onto a local promise: run the call
                            // once the target resolves.
                            self.questions
                                .get_mut(question_id)
                                .expect("checked above")
                                .waiters
                                .push(QuestionWaiter::Pipelined(ParkedSend {
                                    id,
                                    request,
                                    transform,
                                }));
                            return;
                        }
                        (None, false) => {
                            self.network_dispatch(
                                id,
                                TargetMsg::PromisedAnswer { question_id, transform },
                                request,
                            )
                            .await;
                            return;
                        }
                    }
                }
                Capability::Promise {
                    id: answer_id,
                    variant: PromiseVariant::LocalAnswer,
                    transform,
                } => {
                    let Some(ans) = self.answers.get(answer_id) else {
                        self.fulfill_question(
                            id,
                            Err(RpcError::UnknownCapability { id: answer_id }),
                        )
                        .await;
                        return;
                    };
                    match &ans.state {
                        AnswerState::Ready(Ok(payload)) => {
                            let payload = payload.clone();
                            match apply_transform(&payload, &transform) {
                                Ok(cap) => target = cap,
                                Err(e) => {
                                    self.fulfill_question(id, Err(e)).await;
                                    return;
                                }
                            }
                        }
                        AnswerState::Ready(Err(e)) => {
                            let reason = e.to_string();
                            self.fulfill_question(
                                id,
                                Err(RpcError::PromiseBroken { reason }),
                            )
                            .await;
                            return;
                        }
                        AnswerState::Pending => {
                            self.answers
                                .get_mut(answer_id)
                                .expect("checked above")
                                .parked
                                .push(AnswerWaiter::LocalSend(ParkedSend {
                                    id,
                                    request,
                                    transform,
                                }));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serialize and transmit a call for question `id`.
    async fn network_dispatch(&mut self, id: QuestionId, target: TargetMsg, request: Request) {
        let params = request.params.finish();
        let mut descriptors = Vec::with_capacity(params.caps.len());
        let mut param_exports = Vec::new();
        for cap in &params.caps {
            let d = self.send_cap(cap);
            if let CapDescriptor::SenderHosted(export_id) = d {
                param_exports.push(export_id);
            }
            descriptors.push(d);
        }
        if let Some(q) = self.questions.get_mut(id) {
            q.local = false;
            q.param_exports = param_exports;
        }
        let encoded = wire::encode_call(
            id,
            request.interface_id,
            request.method_id,
            &target,
            PayloadContent::Copy(&params.message, params.root),
            &descriptors,
        );
        match encoded {
            Ok(msg) => {
                let _ = self.send_message(&msg).await;
            }
            Err(e) => self.fulfill_question(id, Err(e)).await,
        }
    }

    /// Translate one local capability handle into its wire descriptor,
    /// creating or bumping export entries as needed.
    fn send_cap(&mut self, cap: &Capability) -> CapDescriptor {
        match cap {
            Capability::Local { .. } => {
                let (id, _) = self.exports.export(cap.clone());
                CapDescriptor::SenderHosted(id)
            }
            Capability::Exported { id } => match self.exports.add_ref(*id) {
                Ok(_) => CapDescriptor::SenderHosted(*id),
                Err(e) => {
                    tracing::warn!(id, error = %e, "stale export in payload");
                    CapDescriptor::None
                }
            },
            Capability::Remote { id } => CapDescriptor::ReceiverHosted(*id),
            Capability::Promise {
                id,
                variant: PromiseVariant::Answer,
                transform,
            } => {
                // Only questions on the wire have peer-visible answers.
                match self.questions.get(*id) {
                    Some(q) if !q.local => CapDescriptor::ReceiverAnswer {
                        question_id: *id,
                        transform: transform.clone(),
                    },
                    _ => {
                        tracing::warn!(id, "promise on a local question is not expressible");
                        CapDescriptor::None
                    }
                }
            }
            Capability::Promise {
                id,
                variant: PromiseVariant::Remote | PromiseVariant::Resolve,
                ..
            } => CapDescriptor::ReceiverHosted(*id),
            Capability::Promise {
                id,
                variant: PromiseVariant::LocalAnswer,
                ..
            } => {
                tracing::warn!(id, "promise on a local answer is not expressible");
                CapDescriptor::None
            }
        }
    }

    /// Translate inbound descriptors to local handles. Also returns the
    /// import ids whose refcounts this payload acquired.
    fn receive_caps(
        &mut self,
        table: &[CapDescriptor],
    ) -> Result<(Vec<Capability>, Vec<u32>), RpcError> {
        let mut caps = Vec::with_capacity(table.len());
        let mut acquired = Vec::new();
        for d in table {
            match d {
                CapDescriptor::None => {
                    return Err(RpcError::Protocol("null descriptor in cap table"))
                }
                CapDescriptor::SenderHosted(id) => {
                    self.imports.import(*id, Capability::Remote { id: *id });
                    acquired.push(*id);
                    caps.push(Capability::Remote { id: *id });
                }
                CapDescriptor::SenderPromise(id) => {
                    let cap = Capability::Promise {
                        id: *id,
                        variant: PromiseVariant::Resolve,
                        transform: Vec::new(),
                    };
                    self.imports.import(*id, cap.clone());
                    acquired.push(*id);
                    caps.push(cap);
                }
                CapDescriptor::ReceiverHosted(id) => {
                    if !self.exports.contains(*id) {
                        return Err(RpcError::UnknownCapability { id: *id });
                    }
                    caps.push(Capability::Exported { id: *id });
                }
                CapDescriptor::ReceiverAnswer { question_id, transform } => {
                    caps.push(Capability::Promise {
                        id: *question_id,
                        variant: PromiseVariant::LocalAnswer,
                        transform: transform.clone(),
                    });
                }
                CapDescriptor::ThirdPartyHosted => return Err(RpcError::Unimplemented),
            }
        }
        Ok((caps, acquired))
    }

    // -- inbound -----------------------------------------------------------

    async fn handle_frame(&mut self, segments: Vec<Vec<u8>>) {
        let message = match Message::from_segments(segments) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable message, dropped");
                return;
            }
        };
        let decoded = match wire::decode_message(&message) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable message, dropped");
                return;
            }
        };
        match decoded {
            WireMessage::Call(call) => {
                tracing::trace!(question_id = call.question_id, method_id = call.method_id, "call");
                self.handle_call(message, call).await;
            }
            WireMessage::Return(ret) => {
                tracing::trace!(answer_id = ret.answer_id, "return");
                self.handle_return(message, ret).await;
            }
            WireMessage::Restore { question_id, object_id } => {
                tracing::debug!(question_id, object_id = %object_id, "restore");
                self.handle_restore(question_id, &object_id).await;
            }
            WireMessage::Finish { question_id, release_result_caps } => {
                self.handle_finish(question_id, release_result_caps).await;
            }
            WireMessage::Release { id, count } => {
                self.handle_release(id, count);
            }
            WireMessage::Unimplemented { question_id } => {
                tracing::warn!(?question_id, "peer answered unimplemented");
                if let Some(id) = question_id {
                    self.fulfill_question(id, Err(RpcError::Unimplemented)).await;
                }
            }
            WireMessage::Abort { reason } => {
                tracing::warn!(reason = %reason, "peer aborted the session");
                self.shutdown(RpcError::Remote { reason }).await;
            }
            WireMessage::Unsupported { tag } => {
                tracing::debug!(tag, "unsupported message, echoing unimplemented");
                if let Ok(echo) = wire::encode_unimplemented(&message) {
                    let _ = self.send_message(&echo).await;
                }
            }
        }
    }

    async fn handle_call(&mut self, message: Message, call: wire::CallMsg) {
        let answer_id = call.question_id;
        if self.answers.insert(answer_id).is_err() {
            tracing::warn!(answer_id, "duplicate question id from peer");
            return;
        }
        let caps = match self.receive_caps(&call.cap_table) {
            Ok((caps, _)) => caps,
            Err(RpcError::Unimplemented) => {
                // thirdPartyHosted: echo the whole message back.
                self.answers.remove(answer_id);
                if let Ok(echo) = wire::encode_unimplemented(&message) {
                    let _ = self.send_message(&echo).await;
                }
                return;
            }
            Err(e) => {
                self.complete_answer(answer_id, Err(e)).await;
                return;
            }
        };
        let params = Payload {
            message: Arc::new(message),
            root: call.content,
            caps,
        };
        let target = match call.target {
            TargetMsg::ImportedCap(id) => Capability::Exported { id },
            TargetMsg::PromisedAnswer { question_id, transform } => Capability::Promise {
                id: question_id,
                variant: PromiseVariant::LocalAnswer,
                transform,
            },
        };
        self.dispatch_inbound(answer_id, call.interface_id, call.method_id, target, params)
            .await;
    }

    /// Route an inbound call to a local server, parking it when the target
    /// answer is still pending.
    async fn dispatch_inbound(
        &mut self,
        answer_id: AnswerId,
        interface_id: u64,
        method_id: u16,
        target: Capability,
        params: Payload,
    ) {
        let mut target = target;
        loop {
            match target {
                Capability::Exported { id } => {
                    match self.exports.get(id).map(|e| e.cap.clone()) {
                        Some(cap @ Capability::Local { .. }) => target = cap,
                        Some(_) => {
                            self.complete_answer(
                                answer_id,
                                Err(RpcError::Protocol("export does not hold a local capability")),
                            )
                            .await;
                            return;
                        }
                        None => {
                            self.complete_answer(
                                answer_id,
                                Err(RpcError::UnknownCapability { id }),
                            )
                            .await;
                            return;
                        }
                    }
                }
                Capability::Local { id } => {
                    match self.locals.get(&id).cloned() {
                        Some(server) => {
                            self.spawn_dispatch(
                                server,
                                interface_id,
                                method_id,
                                params,
                                DispatchDone::Answer(answer_id),
                            );
                        }
                        None => {
                            self.complete_answer(
                                answer_id,
                                Err(RpcError::Protocol("dangling local capability")),
                            )
                            .await;
                        }
                    }
                    return;
                }
                Capability::Promise {
                    id,
                    variant: PromiseVariant::LocalAnswer,
                    transform,
                } => {
                    let Some(ans) = self.answers.get(id) else {
                        self.complete_answer(answer_id, Err(RpcError::UnknownCapability { id }))
                            .await;
                        return;
                    };
                    match &ans.state {
                        AnswerState::Ready(Ok(payload)) => {
                            let payload = payload.clone();
                            match apply_transform(&payload, &transform) {
                                Ok(cap) => target = cap,
                                Err(e) => {
                                    self.complete_answer(answer_id, Err(e)).await;
                                    return;
                                }
                            }
                        }
                        AnswerState::Ready(Err(e)) => {
                            let reason = e.to_string();
                            self.complete_answer(
                                answer_id,
                                Err(RpcError::PromiseBroken { reason }),
                            )
                            .await;
                            return;
                        }
                        AnswerState::Pending => {
                            self.answers
                                .get_mut(id)
                                .expect("checked above")
                                .parked
                                .push(AnswerWaiter::InboundCall(ParkedCall {
                                    answer_id,
                                    interface_id,
                                    method_id,
                                    transform,
                                    params,
                                }));
                            return;
                        }
                    }
                }
                _ => {
                    // Proxying a call onward to a third vat is level 3.
                    self.complete_answer(answer_id, Err(RpcError::Unimplemented)).await;
                    return;
                }
            }
        }
    }

    fn spawn_dispatch(
        &self,
        server: Arc<dyn CapabilityServer>,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        done: DispatchDone,
    ) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = server.call(interface_id, method_id, params).await;
            let cmd = match done {
                DispatchDone::Answer(id) => Command::AnswerComplete { id, result },
                DispatchDone::Question(id) => Command::LocalComplete { id, result },
            };
            let _ = cmd_tx.send(cmd).await;
        });
    }

    /// An inbound call finished locally: send the return, record the
    /// result, resume anything parked on it.
    async fn complete_answer(&mut self, id: AnswerId, result: Result<Payload, RpcError>) {
        if self.answers.get(id).is_none() {
            // Finished by the peer before completion; nothing to send.
            return;
        }
        let mut result_exports = Vec::new();
        match &result {
            Ok(payload) => {
                let mut descriptors = Vec::with_capacity(payload.caps.len());
                for cap in &payload.caps {
                    let d = self.send_cap(cap);
                    if let CapDescriptor::SenderHosted(export_id) = d {
                        result_exports.push(export_id);
                    }
                    descriptors.push(d);
                }
                let content = match payload.root.kind {
                    capstan_core::RefKind::Interface { cap } => PayloadContent::Capability(cap),
                    capstan_core::RefKind::Null => PayloadContent::None,
                    _ => PayloadContent::Copy(&payload.message, payload.root),
                };
                match wire::encode_return_results(id, false, content, &descriptors) {
                    Ok(msg) => {
                        let _ = self.send_message(&msg).await;
                    }
                    Err(e) => tracing::warn!(answer_id = id, error = %e, "return encode failed"),
                }
            }
            Err(e) => {
                match wire::encode_return_exception(id, &e.to_string()) {
                    Ok(msg) => {
                        let _ = self.send_message(&msg).await;
                    }
                    Err(enc) => {
                        tracing::warn!(answer_id = id, error = %enc, "exception encode failed")
                    }
                }
            }
        }
        let Some(ans) = self.answers.get_mut(id) else {
            // The session shut down while sending.
            return;
        };
        ans.result_exports = result_exports;
        ans.state = AnswerState::Ready(result.clone());
        let parked = mem::take(&mut ans.parked);
        for waiter in parked {
            self.resume_parked(waiter, &result).await;
        }
    }

    async fn resume_parked(&mut self, waiter: AnswerWaiter, result: &Result<Payload, RpcError>) {
        match waiter {
            AnswerWaiter::InboundCall(call) => match result {
                Ok(payload) => match apply_transform(payload, &call.transform) {
                    Ok(cap) => {
                        Box::pin(self.dispatch_inbound(
                            call.answer_id,
                            call.interface_id,
                            call.method_id,
                            cap,
                            call.params,
                        ))
                        .await
                    }
                    Err(e) => Box::pin(self.complete_answer(call.answer_id, Err(e))).await,
                },
                Err(e) => {
                    let broken = RpcError::PromiseBroken { reason: e.to_string() };
                    Box::pin(self.complete_answer(call.answer_id, Err(broken))).await;
                }
            },
            AnswerWaiter::LocalSend(send) => match result {
                Ok(payload) => match apply_transform(payload, &send.transform) {
                    Ok(cap) => {
                        Box::pin(self.dispatch_into(send.id, cap, send.request)).await
                    }
                    Err(e) => Box::pin(self.fulfill_question(send.id, Err(e))).await,
                },
                Err(e) => {
                    let broken = RpcError::PromiseBroken { reason: e.to_string() };
                    Box::pin(self.fulfill_question(send.id, Err(broken))).await;
                }
            },
        }
    }

    async fn handle_return(&mut self, message: Message, ret: wire::ReturnMsg) {
        let id = ret.answer_id;
        let Some(q) = self.questions.get(id) else {
            tracing::warn!(question_id = id, "return for unknown question");
            return;
        };
        if q.local {
            tracing::warn!(question_id = id, "return for a question never sent");
            return;
        }
        if !q.originator_alive && q.waiters.is_empty() {
            // Cancelled with an early finish; the peer released the result
            // caps on its side, so take nothing from this return.
            self.questions.remove(id);
            return;
        }
        if ret.release_param_caps {
            let param_exports =
                mem::take(&mut self.questions.get_mut(id).expect("checked above").param_exports);
            for export_id in param_exports {
                if let Err(e) = self.exports.release(export_id, 1) {
                    tracing::warn!(export_id, error = %e, "param release failed");
                }
            }
        }
        let result = match ret.body {
            ReturnBody::Results { content, cap_table } => {
                match self.receive_caps(&cap_table) {
                    Ok((caps, acquired)) => {
                        if let Some(q) = self.questions.get_mut(id) {
                            q.result_imports = acquired;
                        }
                        Ok(Payload {
                            message: Arc::new(message),
                            root: content,
                            caps,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            ReturnBody::Exception { reason } => Err(RpcError::Remote { reason }),
        };
        self.fulfill_question(id, result).await;
    }

    /// Deliver a question's result: notify every waiter exactly once,
    /// re-dispatch pipelined calls, then finish if the originator is gone.
    async fn fulfill_question(&mut self, id: QuestionId, result: Result<Payload, RpcError>) {
        let Some(q) = self.questions.get_mut(id) else {
            return;
        };
        if q.result.is_some() {
            tracing::warn!(question_id = id, "second return for a question, dropped");
            return;
        }
        q.result = Some(result.clone());
        let waiters = mem::take(&mut q.waiters);
        for waiter in waiters {
            match waiter {
                QuestionWaiter::Result(tx) => {
                    let _ = tx.send(result.clone());
                }
                QuestionWaiter::Pipelined(send) => match &result {
                    Ok(payload) => match apply_transform(payload, &send.transform) {
                        Ok(cap) => {
                            Box::pin(self.dispatch_into(send.id, cap, send.request)).await
                        }
                        Err(e) => Box::pin(self.fulfill_question(send.id, Err(e))).await,
                    },
                    Err(e) => {
                        let broken = RpcError::PromiseBroken { reason: e.to_string() };
                        Box::pin(self.fulfill_question(send.id, Err(broken))).await;
                    }
                },
            }
        }
        if let Some(q) = self.questions.get(id) {
            if !q.originator_alive && q.waiters.is_empty() {
                self.finish_question(id).await;
            }
        }
    }

    /// Complete a question's lifecycle: tell the peer we are done with the
    /// answer and drop the import refs its result carried.
    async fn finish_question(&mut self, id: QuestionId) {
        let Some(q) = self.questions.remove(id) else {
            return;
        };
        if q.local || self.stopped.is_some() {
            return;
        }
        if let Ok(msg) = wire::encode_finish(id, true) {
            let _ = self.send_message(&msg).await;
        }
        for import_id in q.result_imports {
            if let Err(e) = self.imports.release(import_id, 1) {
                tracing::warn!(import_id, error = %e, "result import release failed");
            }
        }
    }

    /// The originator's handle was dropped.
    async fn question_dropped(&mut self, id: QuestionId) {
        let Some(q) = self.questions.get_mut(id) else {
            return;
        };
        q.originator_alive = false;
        // The originator's own waiter can never be delivered now.
        q.waiters
            .retain(|w| matches!(w, QuestionWaiter::Pipelined(_)));
        if !q.waiters.is_empty() {
            // Pipelined calls still ride on this answer; resolve them when
            // the return arrives.
            return;
        }
        if q.result.is_some() {
            self.finish_question(id).await;
        } else if q.local {
            self.questions.remove(id);
        } else if self.stopped.is_none() {
            // Cancel: tell the peer we no longer care. The entry stays so
            // the id is not reused before the return arrives.
            if let Ok(msg) = wire::encode_finish(id, true) {
                let _ = self.send_message(&msg).await;
            }
        }
    }

    async fn handle_restore(&mut self, question_id: u32, object_id: &str) {
        if self.answers.insert(question_id).is_err() {
            tracing::warn!(question_id, "duplicate restore id from peer");
            return;
        }
        let restored = match &self.restorer {
            Some(restorer) => restorer.restore(object_id),
            None => Err(RpcError::Unimplemented),
        };
        let result = match restored {
            Ok(server) => {
                let local_id = self.register_local(server);
                Ok(Payload::of_capability(Capability::Local { id: local_id }))
            }
            Err(e) => Err(e),
        };
        self.complete_answer(question_id, result).await;
    }

    async fn handle_finish(&mut self, question_id: u32, release_result_caps: bool) {
        let Some(ans) = self.answers.remove(question_id) else {
            tracing::debug!(question_id, "finish for unknown answer");
            return;
        };
        if release_result_caps {
            for export_id in ans.result_exports {
                match self.exports.release(export_id, 1) {
                    Ok(Some(cap)) => tracing::debug!(export_id, ?cap, "export dropped"),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(export_id, error = %e, "finish release failed"),
                }
            }
        }
        // Anything still parked on this answer can never resolve.
        let failed: Result<Payload, RpcError> = Err(RpcError::PromiseBroken {
            reason: "target answer was finished".into(),
        });
        for waiter in ans.parked {
            self.resume_parked(waiter, &failed).await;
        }
    }

    fn handle_release(&mut self, id: u32, count: u32) {
        match self.exports.release(id, count) {
            Ok(Some(cap)) => tracing::debug!(id, ?cap, "export released"),
            Ok(None) => {}
            Err(e) => tracing::warn!(id, count, error = %e, "bad release from peer"),
        }
    }

    // -- plumbing ----------------------------------------------------------

    async fn send_message(&mut self, msg: &Message) -> Result<(), RpcError> {
        let bytes = capstan_core::write_message(msg.segments());
        match self.transport.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = RpcError::TransportFailed(e.to_string());
                Box::pin(self.shutdown(err.clone())).await;
                Err(err)
            }
        }
    }

    /// Terminal: fail every outstanding question, drop the tables, close
    /// the transport.
    async fn shutdown(&mut self, reason: RpcError) {
        if self.stopped.is_some() {
            return;
        }
        tracing::debug!(reason = %reason, "session shutting down");
        self.stopped = Some(reason.clone());
        for id in self.questions.ids() {
            if let Some(q) = self.questions.remove(id) {
                for waiter in q.waiters {
                    if let QuestionWaiter::Result(tx) = waiter {
                        let _ = tx.send(Err(reason.clone()));
                    }
                    // Pipelined waiters point at questions in this same
                    // table; their own waiters fail in this loop.
                }
            }
        }
        self.answers = AnswerTable::new();
        self.exports = ExportTable::new();
        self.imports = ImportTable::new();
        let _ = self.transport.close().await;
    }
}
