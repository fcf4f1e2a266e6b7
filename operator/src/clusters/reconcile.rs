use coral_types::*;
use futures::stream::StreamExt;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action, events::EventType},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{OperatorConfig, actions, planner, status};
use super::actions::{ClusterAction, State};
use crate::db::{admin::HttpAdminClient, session::DigestSchemaSession};
use crate::events::KubeEventSink;
use crate::naming::{self, reasons};
use crate::platform::KubePlatform;
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Timeout for a single blocking call into a node's admin API.
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Entrypoint for the `Cluster` controller.
pub async fn run(client: Client, config: OperatorConfig) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Cluster controller...".green());

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        coral_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    // Preparation of resources used by the `kube_runtime::Controller`
    let context: Arc<ContextData> = Arc::new(ContextData::new(
        client.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    // Leader election keeps exactly one replica reconciling, which is what
    // lets the core run without any locking of cluster state: the lock
    // name is shared across replicas, the identity is per pod (Downward
    // API POD_NAME, hostname as a fallback).
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("coral-cluster-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "coral-cluster-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &config.namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    coral_common::signal_ready();
    println!("{}", "🌱 Cluster controller on standby...".green());
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = config.namespace.clone();
                let crd_api_for_controller: Api<Cluster> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Cluster controller started.".green());
                    Controller::new(crd_api_for_controller, Default::default())
                        .owns(
                            Api::<StatefulSet>::namespaced(
                                client_for_controller.clone(),
                                &controller_namespace,
                            ),
                            Default::default(),
                        )
                        .owns(
                            Api::<Service>::namespaced(
                                client_for_controller,
                                &controller_namespace,
                            ),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    state: State,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (ClusterAction, Instant)>>,
}

impl ContextData {
    /// Wires the production dependencies: the kube-backed platform
    /// facade, the node-local admin HTTP client, and the schema-digest
    /// session. Tests construct a `State` with fakes instead.
    fn new(client: Client, config: OperatorConfig, cancel: CancellationToken) -> Self {
        let state = State {
            platform: KubePlatform::new(client.clone()),
            admin: HttpAdminClient::new(config.admin_port, ADMIN_REQUEST_TIMEOUT),
            sessions: DigestSchemaSession::factory(config.admin_port, ADMIN_REQUEST_TIMEOUT),
            events: KubeEventSink::new(client),
            config,
            cancel,
        };
        #[cfg(feature = "metrics")]
        {
            ContextData {
                state,
                metrics: ControllerMetrics::new("clusters"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                state,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// What one pass over the observed state concluded.
enum SyncDecision {
    /// A workload controller has not caught up with its spec yet; deciding
    /// now would act on stale observations.
    Stale,

    /// Everything converged; nothing to mutate.
    Idle,

    /// The single mutating step for this cycle.
    Act(ClusterAction),
}

impl SyncDecision {
    fn to_str(&self) -> &str {
        match self {
            SyncDecision::Stale => "Stale",
            SyncDecision::Idle => "NoOp",
            SyncDecision::Act(action) => action.to_str(),
        }
    }
}

/// Reconciliation function for the `Cluster` resource.
async fn reconcile(instance: Arc<Cluster>, context: Arc<ContextData>) -> Result<Action, Error> {
    let state = &context.state;

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected Cluster resource to be namespaced. Can't deploy to an unknown namespace."
                    .to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Owned children disappear with the cluster through their owner
    // references; nothing to do but wait.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(Duration::from_secs(2)));
    }

    // Read phase: observe the world, repair child objects, refresh the
    // status, and decide the single next action.
    let (cluster, decision) = match sync(&instance, state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state
                .events
                .publish(
                    &instance,
                    EventType::Warning,
                    reasons::SYNC_FAILED,
                    format!("Failed to sync cluster: {}", e),
                )
                .await;
            return Err(e);
        }
    };

    if let SyncDecision::Act(action) = &decision {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.clone(), Instant::now()),
            )
        };
        if value
            .map(|(last_action, last_instant)| {
                *action != last_action || last_instant.elapsed() > Duration::from_secs(300)
            })
            .unwrap_or(true)
        {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                decision.to_str().color(FG2),
            );
        }
    }

    // Report the read phase performance.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, decision.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, decision.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match &decision {
        SyncDecision::Idle | SyncDecision::Stale => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, decision.to_str()])
                .start_timer(),
        ),
    };

    let result = match decision {
        SyncDecision::Stale => Action::requeue(Duration::from_secs(2)),
        SyncDecision::Idle => Action::requeue(PROBE_INTERVAL),
        SyncDecision::Act(action) => {
            // Execution failures become events, not cycle errors: the next
            // trigger re-evaluates from observed state.
            if let Err(e) = actions::execute(&action, &cluster, state).await {
                eprintln!(
                    "{}",
                    format!("{}/{} {} failed: {}", namespace, name, action.to_str(), e).red()
                );
                let note = format!("{} failed: {}", action.to_str(), e);
                state
                    .events
                    .publish(&cluster, EventType::Warning, reasons::SYNC_FAILED, note.clone())
                    .await;
                let mut st = cluster.status.clone().unwrap_or_default();
                st.message = Some(note);
                if let Err(e) = state.platform.update_cluster_status(&cluster, st).await {
                    eprintln!("failed to surface action failure in status: {e}");
                }
            }
            Action::requeue(PROBE_INTERVAL)
        }
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// One pass of the cycle contract, in order: staleness guard, cleanup of
/// orphaned children, headless service, member services, status refresh,
/// next-action selection. Cleanup failures are recorded but do not abort;
/// the sync steps after it are fatal for the cycle.
async fn sync(cluster: &Cluster, state: &State) -> Result<(Cluster, SyncDecision), Error> {
    let namespace = cluster.namespace().unwrap_or_default();

    // Observe the backing workloads once; every later step works off this
    // snapshot.
    let mut observed: BTreeMap<String, StatefulSet> = BTreeMap::new();
    for rack in &cluster.spec.datacenter.racks {
        let sts_name = naming::statefulset_name(cluster, rack);
        if let Some(sts) = state.platform.get_statefulset(&namespace, &sts_name).await? {
            if status::statefulset_is_stale(&sts) {
                return Ok(((*cluster).clone(), SyncDecision::Stale));
            }
            observed.insert(rack.name.clone(), sts);
        }
    }

    if let Err(e) = cleanup(cluster, state, &namespace, &observed).await {
        state
            .events
            .publish(
                cluster,
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                format!("Failed to clean up cluster resources: {}", e),
            )
            .await;
    }

    sync_headless_service(cluster, state, &namespace).await?;
    sync_member_services(cluster, state, &namespace, &observed).await?;

    // Refresh the per-rack status from observation, but only write when
    // something other than the timestamp changed; an unconditional write
    // would retrigger this very loop.
    let computed = status::computed_status(cluster, &observed);
    let current = cluster.status.clone().unwrap_or_default();
    let mut compare = computed.clone();
    compare.last_updated = current.last_updated.clone();
    if compare != current {
        state
            .platform
            .update_cluster_status(cluster, computed.clone())
            .await?;
    }

    let mut fresh = (*cluster).clone();
    fresh.status = Some(computed);
    let decision = match planner::next_action(&fresh) {
        Some(action) => SyncDecision::Act(action),
        None => SyncDecision::Idle,
    };
    Ok((fresh, decision))
}

/// Deletes member services whose rack or member no longer exists.
async fn cleanup(
    cluster: &Cluster,
    state: &State,
    namespace: &str,
    observed: &BTreeMap<String, StatefulSet>,
) -> Result<(), Error> {
    let headless = naming::headless_service_name(cluster);
    let services = state
        .platform
        .list_services(namespace, &naming::cluster_selector(cluster))
        .await?;
    for service in services {
        let name = service.name_any();
        if name == headless {
            continue;
        }
        let labels = service.metadata.labels.clone().unwrap_or_default();
        let Some(rack_name) = labels.get(naming::RACK_NAME_LABEL) else {
            continue;
        };
        let expected = match (cluster.rack_spec(rack_name), observed.get(rack_name)) {
            (Some(_), Some(sts)) => sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            // Rack gone from the spec, or not materialized at all.
            _ => 0,
        };
        let ordinal = labels
            .get(naming::ORDINAL_LABEL)
            .and_then(|o| o.parse::<i32>().ok());
        let stray = match ordinal {
            Some(ordinal) => ordinal >= expected,
            None => true,
        };
        if stray {
            state.platform.delete_service(namespace, &name).await?;
        }
    }
    Ok(())
}

async fn sync_headless_service(
    cluster: &Cluster,
    state: &State,
    namespace: &str,
) -> Result<(), Error> {
    let service = actions::headless_service(cluster)?;
    state.platform.apply_service(namespace, &service).await
}

/// One identity object per expected member, keyed to its pod by the
/// StatefulSet pod-name label. Existing services keep any labels owned by
/// other steps (the maintenance label in particular).
async fn sync_member_services(
    cluster: &Cluster,
    state: &State,
    namespace: &str,
    observed: &BTreeMap<String, StatefulSet>,
) -> Result<(), Error> {
    for rack in &cluster.spec.datacenter.racks {
        let Some(sts) = observed.get(&rack.name) else {
            continue;
        };
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        for ordinal in 0..replicas {
            let service = actions::member_service(cluster, &rack.name, ordinal)?;
            state.platform.apply_service(namespace, &service).await?;
        }
    }
    Ok(())
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Prints out the error to `stderr` and requeues the resource for another
/// reconciliation. Transient failures (write conflicts, admin API blips)
/// retry quickly; everything else backs off a little.
fn on_error(instance: Arc<Cluster>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error: {:?} ({}/{})",
            error,
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        )
        .red()
    );
    if error.is_transient() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}
