use chrono::Utc;
use dirraft::{
    Attribute, DirectoryEntry, DirectoryNode, DirectoryNodeConfig, DirectoryWriteError, Dn, MemberInfo, Modification,
    RaftOptions, Role,
};
use slog::Drain;
use std::error::Error;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use tokio::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread")]
async fn add_and_modify_converge() -> Result<(), Box<dyn Error>> {
    let nodes = create_cluster(3, 4100).await?;
    let leader = elect(&nodes[0], Duration::from_secs(10)).await;

    // Add on the leader is applied everywhere.
    let output = leader.add(person("alice", "alice@example.com")).await?;
    assert!(output.applied.is_some());
    wait_for_convergence(&nodes, Duration::from_secs(5)).await;
    let guid = leader
        .lookup(&Dn::new("cn=alice"))?
        .and_then(|e| e.first_value_str("objectGUID").map(str::to_string))
        .expect("alice has a guid");
    for node in nodes.iter() {
        let alice = node.lookup(&Dn::new("cn=alice"))?.expect("alice replicated");
        assert_eq!(alice.first_value_str("mail"), Some("alice@example.com"));
        assert_eq!(alice.first_value_str("objectGUID"), Some(guid.as_str()));
    }

    // A later modify converges too.
    leader
        .modify(
            Dn::new("cn=alice"),
            vec![Modification::replace(Attribute::single("mail", "alice@example.org"))],
        )
        .await?;
    wait_for_convergence(&nodes, Duration::from_secs(5)).await;
    for node in nodes.iter() {
        let alice = node.lookup(&Dn::new("cn=alice"))?.expect("alice replicated");
        assert_eq!(alice.first_value_str("mail"), Some("alice@example.org"), "{}", node.server_id());
    }

    let commit_index = leader.persistent_state().commit_index;
    for node in nodes.iter() {
        assert_eq!(node.persistent_state().last_applied, commit_index, "{}", node.server_id());
    }

    for node in nodes.iter() {
        node.shutdown();
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn followers_redirect_and_deletes_replicate() -> Result<(), Box<dyn Error>> {
    let nodes = create_cluster(3, 4200).await?;
    let leader = elect(&nodes[1], Duration::from_secs(10)).await;

    match nodes[0].add(person("bob", "bob@example.com")).await {
        Err(DirectoryWriteError::NotLeader { leader: Some(leader_id) }) => assert_eq!(leader_id, leader.server_id()),
        other => panic!("expected redirect, got {:?}", other.map(|o| o.index)),
    }

    leader.add(person("bob", "bob@example.com")).await?;
    leader.delete(Dn::new("cn=bob")).await?;
    wait_for_convergence(&nodes, Duration::from_secs(5)).await;
    for node in nodes.iter() {
        assert!(node.lookup(&Dn::new("cn=bob"))?.is_none(), "{}", node.server_id());
    }

    // Adding under a parent that doesn't exist commits, but is rejected everywhere.
    let orphan = DirectoryEntry::new(Dn::new("cn=carol,ou=nowhere"), vec![Attribute::single("cn", "carol")]);
    assert!(matches!(
        leader.add(orphan).await,
        Err(DirectoryWriteError::Rejected(_))
    ));
    wait_for_convergence(&nodes, Duration::from_secs(5)).await;
    for node in nodes.iter() {
        assert_eq!(node.unresolved_conflicts().len(), 1, "{}", node.server_id());
        let taken = node.take_unresolved_conflicts();
        assert_eq!(taken.len(), 1, "{}", node.server_id());
        assert_eq!(taken[0].dn, Dn::new("cn=carol,ou=nowhere"));
        assert!(node.unresolved_conflicts().is_empty(), "{}", node.server_id());
    }

    for node in nodes.iter() {
        node.shutdown();
    }
    Ok(())
}

async fn create_cluster(num_members: usize, port_base: u16) -> Result<Vec<DirectoryNode>, Box<dyn Error>> {
    let mut nodes = Vec::with_capacity(num_members);
    for i in 0..num_members {
        nodes.push(dirraft::try_create_directory_node(config(i, num_members, port_base)).await?);
    }

    Ok(nodes)
}

fn config(id: usize, num_members: usize, port_base: u16) -> DirectoryNodeConfig {
    assert!(id < num_members, "ID must be in the range [0, {}]", num_members - 1);

    let cluster_members = (0..num_members).map(|i| member_info(port_base, i)).collect();

    DirectoryNodeConfig {
        my_server_id: server_id(id),
        cluster_members,
        invocation_id: Some(format!("invocation-{}", id + 1)),
        object_store: None,
        info_logger: create_root_logger_for_stdout(server_id(id)),
        options: RaftOptions {
            append_entries_timeout: Some(Duration::from_millis(1000)),
            ..RaftOptions::default()
        },
    }
}

fn member_info(port_base: u16, id: usize) -> MemberInfo {
    MemberInfo {
        server_id: server_id(id),
        ip_addr: Ipv4Addr::from([127, 0, 0, 1]),
        rpc_port: port_base + id as u16,
    }
}

fn server_id(id: usize) -> String {
    format!("dsa-{}", id + 1)
}

fn person(name: &str, mail: &str) -> DirectoryEntry {
    DirectoryEntry::new(
        Dn::new(format!("cn={}", name)),
        vec![
            Attribute::single("objectClass", "person"),
            Attribute::single("cn", name.to_string()),
            Attribute::single("mail", mail.to_string()),
        ],
    )
}

/// Servers come up asynchronously, so the first campaigns may not reach a majority.
async fn elect(candidate: &DirectoryNode, timeout: Duration) -> &DirectoryNode {
    let deadline = Instant::now() + timeout;
    loop {
        match candidate.campaign().await {
            Ok(result) if result.won => {
                assert!(matches!(candidate.role(), Role::Leader { .. }));
                return candidate;
            }
            other => println!("Campaign of {} did not win: {:?}", candidate.server_id(), other),
        }
        assert!(Instant::now() < deadline, "Timeout waiting for leader election");
        sleep(Duration::from_millis(200)).await;
    }
}

/// Wait until every member has applied everything the most advanced member committed.
async fn wait_for_convergence(nodes: &[DirectoryNode], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let commit_index = nodes
            .iter()
            .map(|n| n.persistent_state().commit_index)
            .max()
            .unwrap_or(0);
        if nodes.iter().all(|n| n.persistent_state().last_applied == commit_index) {
            return;
        }
        assert!(Instant::now() < deadline, "Timeout waiting for members to apply {}", commit_index);
        sleep(Duration::from_millis(50)).await;
    }
}

#[allow(dead_code)]
fn create_root_logger_for_file(directory_prefix: String, server_id: String) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/info_log_{}/{}_info.log", directory_prefix, server_id, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

fn create_root_logger_for_stdout(server_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ServerId" => server_id))
}

async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
