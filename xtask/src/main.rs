use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::{
    env, fs,
    process::{Command, Output, Stdio},
};

fn main() -> Result<()> {
    let task = env::args().nth(1);
    match task.as_ref().map(|it| it.as_str()) {
        Some("ci") => ci()?,
        Some("smoke") => smoke()?,
        _ => print_help(),
    }
    Ok(())
}

fn print_help() {
    eprintln!(
        "Tasks:
ci		Runs the CI checks (formatting, lints, tests)
smoke		Starts the spawn server and serves one request from a demo app
"
    )
}

fn ci() -> Result<()> {
    run("cargo fmt -- --check", ".")?;
    run("cargo clippy --all-targets -- -D warnings", ".")?;
    run("cargo test", ".")?;
    Ok(())
}

fn frame_message(parts: &[&str]) -> Vec<u8> {
    let mut payload = Vec::new();
    for part in parts {
        payload.extend_from_slice(part.as_bytes());
        payload.push(0);
    }
    let mut frame = (payload.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(&payload);
    frame
}

fn read_message(stream: &mut UnixStream) -> Result<Vec<String>> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len)?;
    let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload)?;
    Ok(String::from_utf8(payload)?
        .split_terminator('\0')
        .map(str::to_string)
        .collect())
}

fn smoke() -> Result<()> {
    run("cargo build", ".")?;
    let app_root = env::temp_dir().join(format!("zellkern-smoke-{}", std::process::id()));
    fs::create_dir_all(&app_root)?;
    fs::write(app_root.join("index.html"), "smoke test passed\n")?;

    let (mut ours, theirs) = UnixStream::pair()?;
    let mut server = Command::new(project_root().join("target/debug/zellkern"))
        .arg("--channel-fd")
        .arg("0")
        .stdin(Stdio::from(OwnedFd::from(theirs)))
        .spawn()
        .context("starting zellkern")?;

    let root = app_root.to_string_lossy();
    ours.write_all(&frame_message(&[
        "spawn_application",
        "app_root",
        &root,
        "lower_privilege",
        "false",
    ]))?;
    let reply = read_message(&mut ours)?;
    eprintln!("spawn reply: {:?}", reply);
    let socket_path = match reply.as_slice() {
        [status, _pid, socket_path] if status == "ok" => PathBuf::from(socket_path),
        other => bail!("spawning failed: {:?}", other),
    };

    let mut conn = UnixStream::connect(&socket_path)?;
    let headers = b"REQUEST_METHOD\0GET\0PATH_INFO\0/\0";
    conn.write_all(&(headers.len() as u32).to_be_bytes())?;
    conn.write_all(headers)?;
    let mut response = String::new();
    conn.read_to_string(&mut response)?;
    eprintln!("{}", response);

    drop(ours);
    let status = server.wait()?;
    fs::remove_dir_all(&app_root)?;
    if !response.ends_with("smoke test passed\n") {
        bail!("unexpected response");
    }
    if !status.success() {
        bail!("zellkern exited with {}", status);
    }
    Ok(())
}

pub fn run(cmdline: &str, dir: &str) -> Result<()> {
    do_run(cmdline, dir, |c| {
        c.stdout(Stdio::inherit());
    })
    .map(|_| ())
}

fn do_run<F>(cmdline: &str, dir: &str, mut f: F) -> Result<Output>
where
    F: FnMut(&mut Command),
{
    eprintln!("\nwill run: {}", cmdline);
    let proj_dir = project_root().join(dir);
    let mut args = cmdline.split_whitespace();
    let exec = args.next().context("empty command line")?;
    let mut cmd = Command::new(exec);
    f(cmd
        .args(args)
        .current_dir(proj_dir)
        .stderr(Stdio::inherit()));
    let output = cmd
        .output()
        .with_context(|| format!("running `{}`", cmdline))?;
    if !output.status.success() {
        anyhow::bail!("`{}` exited with {}", cmdline, output.status);
    }
    Ok(output)
}

pub fn project_root() -> PathBuf {
    let manifest_dir =
        env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| env!("CARGO_MANIFEST_DIR").to_owned());
    Path::new(&manifest_dir)
        .ancestors()
        .nth(1)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
