//! # Request Dispatcher
//!
//! Purpose: Send a command to its resolved node (or nodes), wait for the
//! reply, and turn what comes back into a value or a typed error.
//!
//! ## Design Principles
//! 1. **Shape From Route**: A single target yields `Reply::Single`; several
//!    targets yield a per-node map, or one merged value when the command has
//!    a response policy. Reply content never decides the shape.
//! 2. **Bounded Redirects**: `Normal -> Redirected -> Fail`. One MOVED
//!    (refresh, then retry) or one ASK (primer, then retry) per call; a
//!    second redirect is returned as an error.
//! 3. **Deadline per Request**: Waiting past the deadline fails the call but
//!    keeps the connection; the late reply is dropped by the connection task.
//! 4. **Close Wins**: Once the client closes, every call returns `Closing`
//!    without further I/O.
//!
//! ## Redirect State Machine
//!
//! ```text
//!            MOVED: refresh, target = moved addr
//! Normal ----------------------------------------> Redirected --redirect--> Fail (error)
//!        \--ASK: target = ask addr, send ASKING --/           \--reply-->  Done
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ckv_common::{Command, Value};
use futures::future::{join_all, select_ok, try_join_all};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command_table::{self, BlockingTimeout, ResponsePolicy};
use crate::config::NodeAddress;
use crate::error::{ClientError, ClientResult, ConfigurationError, RequestError};
use crate::pool::NodeRegistry;
use crate::redirect::{parse_redirect, Redirect};
use crate::routing::{Route, RouteResolver, Targets};
use crate::topology::TopologyManager;
use crate::transaction::Transaction;

/// Result of a dispatched command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Reply of the one target node, or the merged reply of several.
    Single(Value),
    /// Per-node outcomes keyed by node address.
    Multi(BTreeMap<String, ClientResult<Value>>),
}

impl Reply {
    pub fn is_multi(&self) -> bool {
        matches!(self, Reply::Multi(_))
    }

    /// The single value. A per-node map is not a single value and yields
    /// `UnexpectedResponse`.
    pub fn into_single(self) -> ClientResult<Value> {
        match self {
            Reply::Single(value) => Ok(value),
            Reply::Multi(_) => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Per-node values. Fails with `PartialFailure` when any node failed.
    pub fn into_values(self) -> ClientResult<BTreeMap<String, Value>> {
        let outcomes = match self {
            Reply::Multi(outcomes) => outcomes,
            Reply::Single(_) => return Err(ClientError::UnexpectedResponse),
        };
        let mut succeeded = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for (node, outcome) in outcomes {
            match outcome {
                Ok(value) => {
                    succeeded.insert(node, value);
                }
                Err(err) => {
                    failed.insert(node, err);
                }
            }
        }
        if failed.is_empty() {
            Ok(succeeded)
        } else {
            Err(ClientError::PartialFailure { succeeded, failed })
        }
    }
}

enum Mode {
    Standalone(NodeAddress),
    Cluster {
        topology: Arc<TopologyManager>,
        resolver: RouteResolver,
    },
}

/// Routes, sends and classifies requests.
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    mode: Mode,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Dispatcher that sends everything to one node.
    pub fn standalone(
        registry: Arc<NodeRegistry>,
        node: NodeAddress,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Dispatcher {
            registry,
            mode: Mode::Standalone(node),
            request_timeout,
            shutdown,
        }
    }

    /// Dispatcher that routes by slot using `topology`.
    pub fn cluster(
        registry: Arc<NodeRegistry>,
        topology: Arc<TopologyManager>,
        resolver: RouteResolver,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Dispatcher {
            registry,
            mode: Mode::Cluster { topology, resolver },
            request_timeout,
            shutdown,
        }
    }

    /// Executes `cmd`, honoring `route` in cluster mode.
    pub async fn execute(&self, cmd: &Command, route: Option<&Route>) -> ClientResult<Reply> {
        self.until_closed(self.route_and_send(cmd, route)).await
    }

    /// Runs `tx` as one `MULTI ... EXEC` block.
    ///
    /// `Ok(None)` means the server discarded the transaction (a watched key
    /// changed).
    pub async fn exec_transaction(&self, tx: &Transaction, route: Option<&Route>) -> ClientResult<Option<Vec<Value>>> {
        self.until_closed(self.run_transaction(tx, route)).await
    }

    async fn until_closed<T>(&self, work: impl std::future::Future<Output = ClientResult<T>>) -> ClientResult<T> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closing);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ClientError::Closing),
            result = work => result,
        }
    }

    async fn route_and_send(&self, cmd: &Command, route: Option<&Route>) -> ClientResult<Reply> {
        let info = command_table::lookup(cmd);
        let deadline = self.deadline_for(cmd, &info);

        let (topology, resolver) = match &self.mode {
            Mode::Standalone(node) => {
                let value = self.send_to(node, cmd, false, deadline).await?;
                return classify(value, cmd, node).map(Reply::Single);
            }
            Mode::Cluster { topology, resolver } => (topology, resolver),
        };

        let map = topology.snapshot()?;
        match resolver.resolve(cmd, route, &map)? {
            Targets::Single(node) => self
                .send_with_redirects(topology, cmd, node, deadline)
                .await
                .map(Reply::Single),
            Targets::Multi(nodes) => self.fan_out(cmd, nodes, info.policy, deadline).await,
        }
    }

    /// Extra wait for blocking commands; `None` means no deadline at all.
    fn deadline_for(&self, cmd: &Command, info: &command_table::CommandInfo) -> Option<Duration> {
        match command_table::blocking_timeout(cmd, info) {
            None => Some(self.request_timeout),
            Some(BlockingTimeout::Forever) => None,
            Some(BlockingTimeout::For(wait)) => Some(self.request_timeout + wait),
        }
    }

    async fn send_with_redirects(
        &self,
        topology: &TopologyManager,
        cmd: &Command,
        mut node: NodeAddress,
        deadline: Option<Duration>,
    ) -> ClientResult<Value> {
        let mut asking = false;
        let mut redirected = false;
        loop {
            let value = self.send_to(&node, cmd, asking, deadline).await?;
            let redirect = match value.as_server_error() {
                Some(err) if !redirected => parse_redirect(err, &node),
                _ => None,
            };
            let Some(redirect) = redirect else {
                return classify(value, cmd, &node);
            };

            redirected = true;
            match redirect {
                Redirect::Moved { slot, addr } => {
                    debug!(command = %cmd, slot, from = %node, to = %addr, "MOVED, refreshing topology");
                    topology.refresh().await?;
                    node = addr;
                    asking = false;
                }
                Redirect::Ask { slot, addr } => {
                    debug!(command = %cmd, slot, from = %node, to = %addr, "ASK, retrying once");
                    node = addr;
                    asking = true;
                }
            }
        }
    }

    async fn fan_out(
        &self,
        cmd: &Command,
        nodes: Vec<NodeAddress>,
        policy: Option<ResponsePolicy>,
        deadline: Option<Duration>,
    ) -> ClientResult<Reply> {
        let request = |node: NodeAddress| async move {
            let outcome = match self.send_to(&node, cmd, false, deadline).await {
                Ok(value) => classify(value, cmd, &node),
                Err(err) => Err(err),
            };
            (node, outcome)
        };

        match policy {
            None => {
                let outcomes = join_all(nodes.into_iter().map(request)).await;
                Ok(Reply::Multi(
                    outcomes
                        .into_iter()
                        .map(|(node, outcome)| (node.to_string(), outcome))
                        .collect(),
                ))
            }
            Some(ResponsePolicy::OneSucceeded) => {
                if nodes.is_empty() {
                    return Err(ConfigurationError::NotInitialized.into());
                }
                // First success wins and drops the requests still pending.
                let request = &request;
                let attempts = nodes
                    .into_iter()
                    .map(|node| Box::pin(async move { request(node).await.1 }));
                let (value, _) = select_ok(attempts).await?;
                Ok(Reply::Single(value))
            }
            Some(policy) => {
                // All-or-nothing: the first failure drops the other requests.
                let request = &request;
                let values = try_join_all(nodes.into_iter().map(|node| async move {
                    let (_, outcome) = request(node).await;
                    outcome
                }))
                .await?;
                aggregate(values, policy).map(Reply::Single)
            }
        }
    }

    async fn run_transaction(&self, tx: &Transaction, route: Option<&Route>) -> ClientResult<Option<Vec<Value>>> {
        let mut batch = Vec::with_capacity(tx.len() + 2);
        batch.push(Command::new("MULTI"));
        batch.extend(tx.commands().iter().cloned());
        batch.push(Command::new("EXEC"));

        let mut node = self.transaction_target(tx, route)?;
        let mut refreshed = false;
        loop {
            let replies = self.send_batch_to(&node, &batch, Some(self.request_timeout)).await?;
            let Some((exec_reply, queued)) = replies.split_last() else {
                return Err(ClientError::UnexpectedResponse);
            };

            let moved = queued.iter().filter_map(Value::as_server_error).find_map(|err| {
                match parse_redirect(err, &node) {
                    Some(Redirect::Moved { addr, .. }) => Some(addr),
                    _ => None,
                }
            });
            if let (Some(addr), false, Mode::Cluster { topology, .. }) = (moved, refreshed, &self.mode) {
                debug!(from = %node, to = %addr, "transaction hit MOVED, refreshing topology");
                refreshed = true;
                topology.refresh().await?;
                node = match route {
                    Some(_) => addr,
                    None => self.transaction_target(tx, None)?,
                };
                continue;
            }

            return match exec_reply {
                Value::Nil => Ok(None),
                Value::ServerError(err) if err.code() == "EXECABORT" => Err(ClientError::ExecAbort {
                    addr: node.to_string(),
                    message: err.message().to_string(),
                }),
                Value::ServerError(err) => Err(RequestError::from_server(err, "EXEC", &node).into()),
                other => other.clone().into_sequence().map(Some).ok_or(ClientError::UnexpectedResponse),
            };
        }
    }

    fn transaction_target(&self, tx: &Transaction, route: Option<&Route>) -> ClientResult<NodeAddress> {
        let (topology, resolver) = match &self.mode {
            Mode::Standalone(node) => return Ok(node.clone()),
            Mode::Cluster { topology, resolver } => (topology, resolver),
        };
        let map = topology.snapshot()?;
        let exec = Command::new("EXEC");
        let targets = match (route, tx.anchor_slot()) {
            (Some(route), _) => resolver.resolve(&exec, Some(route), &map)?,
            (None, Some(slot)) => Targets::Single(map.primary_for_slot(slot)?.clone()),
            (None, None) => resolver.resolve(&exec, Some(&Route::Random), &map)?,
        };
        match targets {
            Targets::Single(node) => Ok(node),
            Targets::Multi(_) => Err(ConfigurationError::Invalid(
                "transactions run on a single node".to_string(),
            )
            .into()),
        }
    }

    async fn send_to(
        &self,
        node: &NodeAddress,
        cmd: &Command,
        asking: bool,
        deadline: Option<Duration>,
    ) -> ClientResult<Value> {
        if asking {
            let batch = [Command::new("ASKING"), cmd.clone()];
            let mut replies = self.send_batch_to(node, &batch, deadline).await?;
            return replies.pop().ok_or(ClientError::UnexpectedResponse);
        }
        let mut replies = self.send_batch_to(node, std::slice::from_ref(cmd), deadline).await?;
        replies.pop().ok_or(ClientError::UnexpectedResponse)
    }

    async fn send_batch_to(
        &self,
        node: &NodeAddress,
        cmds: &[Command],
        deadline: Option<Duration>,
    ) -> ClientResult<Vec<Value>> {
        // The deadline covers getting a connection as well as the exchange.
        let exchange = async {
            let conn = self.registry.get_connection(node).await?;
            let result = conn.send_batch(cmds).await;
            if let Err(err) = &result {
                if err.is_connection_error() {
                    self.registry.invalidate(node);
                }
            }
            result
        };
        match deadline {
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    let command = cmds.last().map(Command::full_name).unwrap_or_default();
                    debug!(node = %node, %command, ?timeout, "request timed out");
                    Err(ClientError::Timeout {
                        command,
                        addr: node.to_string(),
                        timeout,
                    })
                }
            },
            None => exchange.await,
        }
    }
}

/// Error replies become `RequestError`s naming the command and node.
fn classify(value: Value, cmd: &Command, node: &NodeAddress) -> ClientResult<Value> {
    match value {
        Value::ServerError(err) => {
            Err(RequestError::from_server(&err, command_table::lookup_name(cmd), node).into())
        }
        value => Ok(value),
    }
}

fn aggregate(values: Vec<Value>, policy: ResponsePolicy) -> ClientResult<Value> {
    match policy {
        ResponsePolicy::AllSucceeded | ResponsePolicy::OneSucceeded => {
            Ok(values.into_iter().next().unwrap_or(Value::Nil))
        }
        ResponsePolicy::AggregateSum => values
            .into_iter()
            .try_fold(0i64, |sum, value| match value {
                Value::Int(n) => Ok(sum.saturating_add(n)),
                _ => Err(ClientError::UnexpectedResponse),
            })
            .map(Value::Int),
        ResponsePolicy::CombineArrays => {
            let mut combined = Vec::new();
            for value in values {
                combined.extend(value.into_sequence().ok_or(ClientError::UnexpectedResponse)?);
            }
            Ok(Value::Array(combined))
        }
    }
}
