use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};

const PROTO_DIR: &str = "./protos/";
const GENERATED_DIR: &str = "./generated/";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed={}raft.proto", PROTO_DIR);
    build_proto()
}

// Generated code holds the peer RPC service and the change-record messages stored in log entries.
fn build_proto() -> io::Result<()> {
    idempotent_create_dir(GENERATED_DIR)?;
    tonic_build::configure()
        .out_dir(GENERATED_DIR)
        .compile(&["./protos/raft.proto"], &[PROTO_DIR])
}

fn idempotent_create_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            ErrorKind::AlreadyExists => Ok(()),
            _ => Err(e),
        },
    }
}
