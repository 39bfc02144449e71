use std::io::Write;

/// Rings the terminal bell and, when configured, runs the operator's warn
/// command. Failures to alert are logged and otherwise ignored; the warning
/// itself already went to the log.
pub fn alert(warn_command: &[String]) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(b"\x07");
    let _ = stdout.flush();

    let Some((program, args)) = warn_command.split_first() else {
        return;
    };
    match std::process::Command::new(program).args(args).status() {
        Ok(status) if !status.success() => {
            eprintln!("[cloudsnap] warn command {program} exited with {status}");
        }
        Ok(_) => {}
        Err(err) => {
            eprintln!("[cloudsnap] couldn't run warn command {program}: {err}");
        }
    }
}
