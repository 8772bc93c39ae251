//! In-memory [`ResourceStore`] with a minimal StatefulSet controller
//!
//! Objects are kept as JSON keyed by kind, namespace and name. Creating,
//! updating or patching a StatefulSet brings its pods `<sts>-<ordinal>` to
//! the replica count; deleting a pod an existing StatefulSet still wants
//! recreates it with a new UID, the way the real controller would.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use serde_json::Value;

use pg_cluster_operator::crd::{PostgresCluster, PostgresClusterStatus};
use pg_cluster_operator::resources::common::POSTGRES_CONTAINER;
use pg_cluster_operator::store::{ResourceStore, StoreError, StoreResult, StoredResource};

type Key = (String, String, String);

/// An event recorded on a cluster
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    mutations: usize,
    events: Vec<RecordedEvent>,
    execs: Vec<(String, Vec<String>)>,
    /// (kind, name, JSON patch document) in call order
    patches: Vec<(String, String, Value)>,
    exec_error: Option<StoreError>,
    /// Next call of a kind fails with this error
    failures: BTreeMap<(String, &'static str), StoreError>,
    pods_ready: bool,
    next_uid: u64,
    next_version: u64,
    role_label: String,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_of<K: StoredResource>() -> String {
    K::kind(&()).to_string()
}

fn serialization(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    value["metadata"]["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pods_ready: true,
                role_label: "spilo-role".to_string(),
                ..Default::default()
            })),
        }
    }

    /// Write calls that succeeded, events excluded
    pub fn mutations(&self) -> usize {
        self.inner.lock().unwrap().mutations
    }

    pub fn reset_mutations(&self) {
        self.inner.lock().unwrap().mutations = 0;
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.inner.lock().unwrap().execs.clone()
    }

    pub fn patches(&self) -> Vec<(String, String, Value)> {
        self.inner.lock().unwrap().patches.clone()
    }

    /// Replica counts written to a StatefulSet through patches, in order
    pub fn replica_patches(&self, name: &str) -> Vec<i64> {
        self.patches()
            .into_iter()
            .filter(|(kind, sts, _)| kind == "StatefulSet" && sts == name)
            .flat_map(|(_, _, doc)| doc.as_array().cloned().unwrap_or_default())
            .filter(|op| op["path"] == "/spec/replicas")
            .filter_map(|op| op["value"].as_i64())
            .collect()
    }

    pub fn fail_exec(&self, error: StoreError) {
        self.inner.lock().unwrap().exec_error = Some(error);
    }

    /// Make the next `operation` ("create", "update", "get", ...) on `kind` fail
    pub fn fail_next(&self, kind: &str, operation: &'static str, error: StoreError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert((kind.to_string(), operation), error);
    }

    /// Readiness given to pods created from now on
    pub fn set_pods_ready(&self, ready: bool) {
        self.inner.lock().unwrap().pods_ready = ready;
    }

    /// Flip the readiness of one existing pod
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut inner = self.inner.lock().unwrap();
        let key = ("Pod".to_string(), namespace.to_string(), name.to_string());
        if let Some(pod) = inner.objects.get_mut(&key) {
            pod["status"] = serde_json::to_value(pod_status(ready)).unwrap();
        }
    }

    /// Put an object in place without counting a mutation
    pub fn seed<K: StoredResource>(&self, obj: &K) {
        let mut inner = self.inner.lock().unwrap();
        let mut value = serde_json::to_value(obj).unwrap();
        inner.stamp(&mut value, true);
        let key = (
            kind_of::<K>(),
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
        );
        inner.objects.insert(key, value);
        if K::kind(&()) == "StatefulSet" {
            let (ns, name) = (obj.namespace().unwrap_or_default(), obj.name_any());
            inner.reconcile_pods(&ns, &name);
        }
    }

    /// Typed read without going through the trait
    pub fn object<K: StoredResource>(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(kind_of::<K>(), namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn count<K: StoredResource>(&self, namespace: &str) -> usize {
        let kind = kind_of::<K>();
        self.inner
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }

    pub fn names<K: StoredResource>(&self, namespace: &str) -> Vec<String> {
        let kind = kind_of::<K>();
        self.inner
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }
}

fn pod_status(ready: bool) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        container_statuses: Some(vec![ContainerStatus {
            name: POSTGRES_CONTAINER.to_string(),
            ready,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

impl Inner {
    fn take_failure(&mut self, kind: &str, operation: &'static str) -> StoreResult<()> {
        match self.failures.remove(&(kind.to_string(), operation)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Assign a resource version, and a UID on creation
    fn stamp(&mut self, value: &mut Value, created: bool) {
        self.next_version += 1;
        value["metadata"]["resourceVersion"] = Value::String(self.next_version.to_string());
        if created && value["metadata"]["uid"].is_null() {
            self.next_uid += 1;
            value["metadata"]["uid"] = Value::String(format!("uid-{}", self.next_uid));
        }
    }

    fn new_pod(&mut self, sts: &StatefulSet, ordinal: i32) -> Value {
        let template = sts.spec.clone().unwrap_or_default().template;
        let mut metadata = template.metadata.unwrap_or_default();
        let mut labels = metadata.labels.take().unwrap_or_default();
        let role = if ordinal == 0 { "master" } else { "replica" };
        labels.insert(self.role_label.clone(), role.to_string());
        metadata.labels = Some(labels);
        metadata.name = Some(format!("{}-{ordinal}", sts.name_any()));
        metadata.namespace = sts.namespace();
        metadata.uid = None;

        let pod = Pod {
            metadata,
            spec: template.spec,
            status: Some(pod_status(self.pods_ready)),
        };
        let mut value = serde_json::to_value(pod).unwrap();
        self.stamp(&mut value, true);
        value
    }

    /// Bring the pods of a StatefulSet to its replica count
    fn reconcile_pods(&mut self, namespace: &str, name: &str) {
        let key = ("StatefulSet".to_string(), namespace.to_string(), name.to_string());
        let Some(sts) = self.objects.get(&key).cloned() else {
            return;
        };
        let sts: StatefulSet = serde_json::from_value(sts).unwrap();
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);

        for ordinal in 0..replicas {
            let pod_key = ("Pod".to_string(), namespace.to_string(), format!("{name}-{ordinal}"));
            if !self.objects.contains_key(&pod_key) {
                let pod = self.new_pod(&sts, ordinal);
                self.objects.insert(pod_key, pod);
            }
        }
        let prefix = format!("{name}-");
        let surplus: Vec<Key> = self
            .objects
            .keys()
            .filter(|(k, ns, pod)| {
                k == "Pod"
                    && ns == namespace
                    && pod
                        .strip_prefix(&prefix)
                        .and_then(|o| o.parse::<i32>().ok())
                        .is_some_and(|o| o >= replicas)
            })
            .cloned()
            .collect();
        for key in surplus {
            self.objects.remove(&key);
        }
    }

    /// StatefulSet owning a pod name, if it still exists
    fn owner_of(&self, namespace: &str, pod: &str) -> Option<String> {
        let (sts, ordinal) = pod.rsplit_once('-')?;
        ordinal.parse::<i32>().ok()?;
        self.objects
            .contains_key(&("StatefulSet".to_string(), namespace.to_string(), sts.to_string()))
            .then(|| sts.to_string())
    }
}

impl ResourceStore for MemoryStore {
    async fn get<K: StoredResource>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure(&kind_of::<K>(), "get")?;
        inner
            .objects
            .get(&(kind_of::<K>(), namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).map_err(serialization))
            .transpose()
    }

    async fn list<K: StoredResource>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<K>> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner.take_failure(&kind, "list")?;
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, value)| {
                let have = labels_of(value);
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(serialization))
            .collect()
    }

    async fn create<K: StoredResource>(&self, obj: &K) -> StoreResult<K> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner.take_failure(&kind, "create")?;
        let namespace = obj
            .namespace()
            .ok_or_else(|| StoreError::Serialization(format!("{} has no namespace", obj.name_any())))?;
        let key = (kind.clone(), namespace.clone(), obj.name_any());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{kind} {}", obj.name_any())));
        }
        let mut value = serde_json::to_value(obj).map_err(serialization)?;
        inner.stamp(&mut value, true);
        inner.objects.insert(key, value.clone());
        inner.mutations += 1;
        if kind == "StatefulSet" {
            inner.reconcile_pods(&namespace, &obj.name_any());
        }
        serde_json::from_value(value).map_err(serialization)
    }

    async fn update<K: StoredResource>(&self, obj: &K) -> StoreResult<K> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner.take_failure(&kind, "update")?;
        let namespace = obj.namespace().unwrap_or_default();
        let key = (kind.clone(), namespace.clone(), obj.name_any());
        let Some(existing) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(format!("{kind} {}", obj.name_any())));
        };
        let mut value = serde_json::to_value(obj).map_err(serialization)?;
        value["metadata"]["uid"] = existing["metadata"]["uid"].clone();
        if value.get("status").is_none_or(Value::is_null) {
            if let Some(status) = existing.get("status") {
                value["status"] = status.clone();
            }
        }
        inner.stamp(&mut value, false);
        inner.objects.insert(key, value.clone());
        inner.mutations += 1;
        if kind == "StatefulSet" {
            inner.reconcile_pods(&namespace, &obj.name_any());
        }
        serde_json::from_value(value).map_err(serialization)
    }

    async fn patch<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> StoreResult<K> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner.take_failure(&kind, "patch")?;
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        let Some(mut value) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(format!("{kind} {name}")));
        };
        json_patch::patch(&mut value, patch).map_err(|e| StoreError::Api {
            code: 422,
            message: e.to_string(),
        })?;
        inner.stamp(&mut value, false);
        inner.objects.insert(key, value.clone());
        inner.mutations += 1;
        let document = serde_json::to_value(patch).map_err(serialization)?;
        inner.patches.push((kind.clone(), name.to_string(), document));
        if kind == "StatefulSet" {
            inner.reconcile_pods(namespace, name);
        }
        serde_json::from_value(value).map_err(serialization)
    }

    async fn delete<K: StoredResource>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner.take_failure(&kind, "delete")?;
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        if inner.objects.remove(&key).is_none() {
            return Err(StoreError::NotFound(format!("{kind} {name}")));
        }
        inner.mutations += 1;

        match kind.as_str() {
            "Pod" => {
                if let Some(sts) = inner.owner_of(namespace, name) {
                    inner.reconcile_pods(namespace, &sts);
                }
            }
            "StatefulSet" => {
                let prefix = format!("{name}-");
                inner.objects.retain(|(k, ns, pod), _| {
                    !(k == "Pod" && ns == namespace && pod.starts_with(&prefix))
                });
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete_orphaning<K: StoredResource>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner.take_failure(&kind, "delete")?;
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        if inner.objects.remove(&key).is_none() {
            return Err(StoreError::NotFound(format!("{kind} {name}")));
        }
        inner.mutations += 1;
        Ok(())
    }

    async fn patch_status(
        &self,
        cluster: &PostgresCluster,
        status: &PostgresClusterStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure("PostgresCluster", "patch_status")?;
        let key = (
            "PostgresCluster".to_string(),
            cluster.namespace().unwrap_or_default(),
            cluster.name_any(),
        );
        let status = serde_json::to_value(status).map_err(serialization)?;
        match inner.objects.get_mut(&key) {
            Some(value) => value["status"] = status,
            None => return Err(StoreError::NotFound(format!("PostgresCluster {}", cluster.name_any()))),
        }
        inner.mutations += 1;
        Ok(())
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: Vec<String>,
    ) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.execs.push((pod.to_string(), command));
        match inner.exec_error.take() {
            Some(error) => Err(error),
            None => Ok(String::new()),
        }
    }

    async fn record_event(
        &self,
        _cluster: &PostgresCluster,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> StoreResult<()> {
        self.inner.lock().unwrap().events.push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note: note.to_string(),
        });
        Ok(())
    }
}
