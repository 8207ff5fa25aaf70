//! MongoDB nodes: standalone, replica-set members, and arbiters.

use super::{Identity, Workload};
use crate::chef::Attributes;
use crate::naming::{Environment, NameTemplate};
use crate::ssh;
use color_eyre::Report;
use eyre::WrapErr;
use serde_json::{json, Value};

const SERVER_TYPE: &str = "mongo";

fn mongo_run_list(environment: Environment) -> Vec<String> {
    let mut rl = vec!["role[RoleMongo]".to_string()];
    if environment == Environment::Prod {
        rl.push("role[RoleSumoLogic]".to_string());
    }
    rl
}

fn mongo_security_groups(environment: Environment, envcl: &str) -> Vec<String> {
    vec![
        "management".to_string(),
        "chef-nodes".to_string(),
        envcl.to_string(),
        format!("{}-mongo-management", environment.initial()),
    ]
}

fn replica_set_name(group: &str, replica_set: u32) -> String {
    format!("{}-rs{}", group, replica_set)
}

fn common_attributes(id: &Identity<'_>, node_type: &str, attributes: &mut Attributes) {
    attributes.set_dotted("mongodb.cluster_name", id.group);
    tracing::info!(cluster = %id.group, "set the cluster name");
    attributes.set_dotted("mongodb.node_type", node_type);
    tracing::info!(%node_type, "set the MongoDB node type");
}

/// A standalone MongoDB node.
#[derive(Clone, Copy, Debug, Default)]
pub struct MongoNode;

impl Workload for MongoNode {
    fn server_type(&self) -> Option<&str> {
        Some(SERVER_TYPE)
    }

    fn run_list(&self, environment: Environment) -> Vec<String> {
        mongo_run_list(environment)
    }

    fn role_policies(&self, _: Environment) -> Vec<String> {
        vec!["allow-volume-control".to_string()]
    }

    fn security_groups(&self, environment: Environment, envcl: &str) -> Option<Vec<String>> {
        Some(mongo_security_groups(environment, envcl))
    }

    fn attributes(&self, id: &Identity<'_>, attributes: &mut Attributes) {
        common_attributes(id, "generic", attributes);
    }
}

/// A member of replica set `{group}-rs{n}`.
#[derive(Clone, Copy, Debug)]
pub struct MongoReplicaSetMember {
    replica_set: u32,
}

impl Default for MongoReplicaSetMember {
    fn default() -> Self {
        MongoReplicaSetMember { replica_set: 1 }
    }
}

impl MongoReplicaSetMember {
    /// A member of the given replica set, or of set 1 if none is given.
    pub fn new(replica_set: Option<u32>) -> Self {
        let replica_set = replica_set.unwrap_or_else(|| {
            tracing::warn!("no replica set provided");
            1
        });
        tracing::info!(replica_set, "using replica set");
        MongoReplicaSetMember { replica_set }
    }

    pub fn replica_set(&self) -> u32 {
        self.replica_set
    }
}

impl Workload for MongoReplicaSetMember {
    fn server_type(&self) -> Option<&str> {
        Some(SERVER_TYPE)
    }

    fn run_list(&self, environment: Environment) -> Vec<String> {
        mongo_run_list(environment)
    }

    fn role_policies(&self, _: Environment) -> Vec<String> {
        vec!["allow-volume-control".to_string()]
    }

    fn security_groups(&self, environment: Environment, envcl: &str) -> Option<Vec<String>> {
        Some(mongo_security_groups(environment, envcl))
    }

    fn name_fields(&self) -> Vec<(&'static str, String)> {
        vec![("replica_set", self.replica_set.to_string())]
    }

    fn attributes(&self, id: &Identity<'_>, attributes: &mut Attributes) {
        common_attributes(id, "generic", attributes);
        let rs = replica_set_name(id.group, self.replica_set);
        attributes.set_dotted("mongodb.replicaset_name", rs.as_str());
        tracing::info!(name = %rs, "set the replica set name");
    }

    fn tags(&self, id: &Identity<'_>) -> Vec<(String, String)> {
        vec![(
            "ReplicaSet".to_string(),
            replica_set_name(id.group, self.replica_set),
        )]
    }
}

/// The arbiter of a replica set. There is one per set and location, so it is not indexed.
#[derive(Clone, Copy, Debug, Default)]
pub struct MongoArbiter {
    member: MongoReplicaSetMember,
}

impl MongoArbiter {
    pub fn new(replica_set: Option<u32>) -> Self {
        MongoArbiter {
            member: MongoReplicaSetMember::new(replica_set),
        }
    }
}

impl Workload for MongoArbiter {
    fn server_type(&self) -> Option<&str> {
        Some(SERVER_TYPE)
    }

    fn run_list(&self, environment: Environment) -> Vec<String> {
        mongo_run_list(environment)
    }

    fn role_policies(&self, environment: Environment) -> Vec<String> {
        self.member.role_policies(environment)
    }

    fn security_groups(&self, environment: Environment, envcl: &str) -> Option<Vec<String>> {
        self.member.security_groups(environment, envcl)
    }

    fn name_template(&self) -> NameTemplate {
        NameTemplate {
            template: "{envcl}-rs{replica_set}-{location}-arb".into(),
            search_prefix: "{envcl}-rs{replica_set}-{location}-".into(),
            auto_index: false,
        }
    }

    fn name_fields(&self) -> Vec<(&'static str, String)> {
        self.member.name_fields()
    }

    fn attributes(&self, id: &Identity<'_>, attributes: &mut Attributes) {
        self.member.attributes(id, attributes);
        attributes.set_dotted("mongodb.node_type", "arbiter");
        attributes.set_dotted(
            "ebs.volumes",
            json!([{
                "user": "mongod",
                "group": "mongod",
                "size": 1,
                "iops": 0,
                "device": "/dev/xvdf",
                "mount": "/volr",
            }]),
        );
        tracing::info!("configured the ebs.volumes attribute");
        attributes.set_dotted("mongodb.config.smallfiles", true);
    }

    fn tags(&self, id: &Identity<'_>) -> Vec<(String, String)> {
        self.member.tags(id)
    }
}

/// Parse the output of `mongo --eval "JSON.stringify(..)"`.
///
/// The shell prints its version and connection banner first; the value is on the third line.
pub fn parse_eval_output(stdout: &str) -> Result<Value, Report> {
    let line = stdout
        .lines()
        .nth(2)
        .ok_or_else(|| eyre::eyre!("mongo printed no result: {:?}", stdout))?;
    serde_json::from_str(line).wrap_err_with(|| format!("mongo printed non-JSON {:?}", line))
}

/// Evaluate a JavaScript expression in the node's mongo shell and return its JSON value.
pub async fn mongo_eval(session: &ssh::Session, expression: &str) -> Result<Value, Report> {
    let cmd = format!(
        "mongo --port 27018 --eval \"JSON.stringify({})\"",
        expression
    );
    let out = session.run(&cmd).await?;
    if !out.success {
        eyre::bail!("mongo eval failed: {}", out.stderr.trim());
    }
    parse_eval_output(&out.stdout)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workloads::test::identity;

    #[test]
    fn node_defaults() {
        let n = MongoNode;
        assert_eq!(n.server_type(), Some("mongo"));
        assert_eq!(n.run_list(Environment::Stage), vec!["role[RoleMongo]"]);
        assert_eq!(
            n.run_list(Environment::Prod),
            vec!["role[RoleMongo]", "role[RoleSumoLogic]"]
        );
        assert_eq!(
            n.security_groups(Environment::Stage, "s-video-mongo"),
            Some(vec![
                "management".to_string(),
                "chef-nodes".to_string(),
                "s-video-mongo".to_string(),
                "s-mongo-management".to_string(),
            ])
        );

        let id = identity(Environment::Stage, "mongo", "s-video-mongo");
        let mut attrs = Attributes::default();
        n.attributes(&id, &mut attrs);
        assert_eq!(attrs.get_dotted("mongodb.cluster_name"), Some(&json!("video")));
        assert_eq!(attrs.get_dotted("mongodb.node_type"), Some(&json!("generic")));
    }

    #[test]
    fn member_names_its_set() {
        let m = MongoReplicaSetMember::new(Some(3));
        let id = identity(Environment::Prod, "mongo", "p-video-mongo");
        let mut attrs = Attributes::default();
        m.attributes(&id, &mut attrs);
        assert_eq!(
            attrs.get_dotted("mongodb.replicaset_name"),
            Some(&json!("video-rs3"))
        );
        // members keep the generic node type; only arbiters differ
        assert_eq!(attrs.get_dotted("mongodb.node_type"), Some(&json!("generic")));
        assert_eq!(
            m.tags(&id),
            vec![("ReplicaSet".to_string(), "video-rs3".to_string())]
        );
        assert_eq!(MongoReplicaSetMember::new(None).replica_set(), 1);
    }

    #[test]
    fn arbiter_is_not_indexed() {
        let a = MongoArbiter::new(Some(2));
        let t = a.name_template();
        assert!(!t.auto_index);
        let fields: std::collections::HashMap<&str, String> = vec![
            ("envcl", "s-video-mongo".to_string()),
            ("location", "use1c".to_string()),
        ]
        .into_iter()
        .chain(a.name_fields())
        .collect();
        assert_eq!(
            crate::naming::render(&t.template, &fields).unwrap(),
            "s-video-mongo-rs2-use1c-arb"
        );
        assert_eq!(a.run_list(Environment::Stage), vec!["role[RoleMongo]"]);
        assert_eq!(
            a.run_list(Environment::Prod),
            vec!["role[RoleMongo]", "role[RoleSumoLogic]"]
        );
    }

    #[test]
    fn arbiter_attributes() {
        let a = MongoArbiter::new(None);
        let id = identity(Environment::Test, "mongo", "t-video-mongo");
        let mut attrs = Attributes::default();
        a.attributes(&id, &mut attrs);
        assert_eq!(attrs.get_dotted("mongodb.node_type"), Some(&json!("arbiter")));
        assert_eq!(
            attrs.get_dotted("mongodb.replicaset_name"),
            Some(&json!("video-rs1"))
        );
        assert_eq!(
            attrs.get_dotted("mongodb.config.smallfiles"),
            Some(&json!(true))
        );
        let vols = attrs.get_dotted("ebs.volumes").unwrap();
        assert_eq!(vols[0]["mount"], "/volr");
        assert_eq!(vols[0]["size"], 1);
    }

    #[test]
    fn eval_output() {
        let out = "MongoDB shell version: 3.0.12\nconnecting to: 127.0.0.1:27018/test\n{\"ok\":1}\n";
        assert_eq!(parse_eval_output(out).unwrap(), json!({"ok": 1}));
        assert!(parse_eval_output("MongoDB shell version: 3.0.12\n").is_err());
        assert!(parse_eval_output("a\nb\nnot json\n").is_err());
    }
}
