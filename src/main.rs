use dirraft::{DirectoryNodeConfig, MemberInfo, RaftOptions};
use slog::Drain;
use std::error::Error;
use std::net::Ipv4Addr;

/// Runs one member of a local three member cluster. Usage: `dirraft <member number 1-3> [--campaign]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let member_number: usize = match args.get(1).map(|arg| arg.parse()) {
        Some(Ok(n)) if (1..=3).contains(&n) => n,
        _ => return Err("usage: dirraft <member number 1-3> [--campaign]".into()),
    };
    let campaign = args.iter().any(|arg| arg == "--campaign");

    let my_server_id = server_id(member_number);
    let logger = create_root_logger_for_stdout(my_server_id.clone());
    let node = dirraft::try_create_directory_node(DirectoryNodeConfig {
        my_server_id,
        cluster_members: (1..=3).map(member_info).collect(),
        invocation_id: None,
        object_store: None,
        info_logger: logger.clone(),
        options: RaftOptions::default(),
    })
    .await?;

    if campaign {
        let result = node.campaign().await?;
        slog::info!(logger, "Campaign finished: {:?}", result);
    }

    tokio::signal::ctrl_c().await?;
    node.shutdown();
    slog::info!(logger, "Final state: {:?}", node.persistent_state());

    Ok(())
}

fn server_id(member_number: usize) -> String {
    format!("dsa-{}", member_number)
}

fn member_info(member_number: usize) -> MemberInfo {
    MemberInfo {
        server_id: server_id(member_number),
        ip_addr: Ipv4Addr::LOCALHOST,
        rpc_port: 7000 + member_number as u16,
    }
}

fn create_root_logger_for_stdout(server_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ServerId" => server_id))
}
