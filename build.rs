use std::process::Command;

fn git(args: &[&str]) -> Option<std::process::Output> {
    Command::new("git").args(args).output().ok()
}

fn main() {
    // Container builds have no .git, they pass the hash in
    let git_hash = std::env::var("GIT_HASH").ok().unwrap_or_else(|| {
        match git(&["rev-parse", "--short", "HEAD"]) {
            Some(o) if o.status.success() => {
                let hash = String::from_utf8_lossy(&o.stdout).trim().to_string();
                let dirty = git(&["diff", "--quiet"]).is_some_and(|o| !o.status.success());
                if dirty { format!("{}-dirty", hash) } else { hash }
            }
            _ => "unknown".to_string(),
        }
    });

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rerun-if-env-changed=GIT_HASH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
