//! Mock qemu-eos binary for integration testing
//!
//! Accepts the emulator's command line, listens on the monitor socket given
//! via `-chardev` and answers monitor commands without emulating anything.
//! The screen is a solid colour that changes with every key press.
//!
//! Behaviour is controlled through the environment:
//! - `MOCK_EMULATOR_EXIT_EARLY`: print an error and exit before listening
//! - `MOCK_EMULATOR_STDERR` / `MOCK_EMULATOR_STDOUT`: `|`-separated lines
//!   printed at startup
//! - `MOCK_EMULATOR_DUMP_DELAY_MS`: wait this long before writing a screendump
//!
//! The monitor is a unix socket, so on other platforms the mock only reports
//! that it can't run.

#[cfg(unix)]
fn main() {
    unix::run();
}

#[cfg(not(unix))]
fn main() {
    eprintln!("mock: the monitor socket needs a unix platform");
    std::process::exit(2);
}

#[cfg(unix)]
mod unix {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// Screen size of the fake display
    const WIDTH: usize = 8;
    const HEIGHT: usize = 6;

    /// Written into the working dir so tests can check how the mock was started
    const INVOCATION_FILE: &str = "mock_invocation.txt";

    /// Colour of the screen after `presses` key presses
    fn frame_color(presses: u32) -> [u8; 3] {
        let n = presses.wrapping_mul(40) as u8;
        [n, 255 - n, 128]
    }

    pub fn run() {
        let args: Vec<String> = std::env::args().skip(1).collect();

        let workdir = std::env::var("QEMU_EOS_WORKDIR").unwrap_or_default();
        let _ = std::fs::write(
            INVOCATION_FILE,
            format!("QEMU_EOS_WORKDIR={}\n{}\n", workdir, args.join("\n")),
        );

        print_lines("MOCK_EMULATOR_STDOUT", &mut std::io::stdout());
        print_lines("MOCK_EMULATOR_STDERR", &mut std::io::stderr());

        if std::env::var_os("MOCK_EMULATOR_EXIT_EARLY").is_some() {
            eprintln!("mock: could not load ROM");
            std::process::exit(1);
        }

        let Some(socket) = monitor_path(&args) else {
            eprintln!("mock: no -chardev socket path given");
            std::process::exit(2);
        };

        let _ = std::fs::remove_file(&socket);
        let listener = match UnixListener::bind(&socket) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("mock: couldn't bind {}: {}", socket.display(), e);
                std::process::exit(2);
            }
        };

        let mut presses = 0u32;
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            if serve(stream, &mut presses) {
                break;
            }
        }
        let _ = std::fs::remove_file(&socket);
    }

    fn print_lines<W: Write>(var: &str, out: &mut W) {
        if let Ok(text) = std::env::var(var) {
            for line in text.split('|') {
                let _ = writeln!(out, "{}", line);
            }
            let _ = out.flush();
        }
    }

    /// Socket path out of `-chardev socket,server,nowait,path=...,id=monsock`
    fn monitor_path(args: &[String]) -> Option<PathBuf> {
        let pos = args.iter().position(|a| a == "-chardev")?;
        args.get(pos + 1)?
            .split(',')
            .find_map(|part| part.strip_prefix("path="))
            .map(PathBuf::from)
    }

    /// Handle one monitor connection; true once the mock should exit
    fn serve(stream: UnixStream, presses: &mut u32) -> bool {
        let Ok(mut writer) = stream.try_clone() else {
            return false;
        };
        let _ = writer.write_all(b"QEMU monitor (mock)\n(qemu) ");

        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            let mut parts = line.trim().splitn(2, ' ');
            let command = parts.next().unwrap_or("");
            let arg = parts.next().unwrap_or("").trim();

            match command {
                "sendkey" => *presses += 1,
                "screendump" => {
                    if let Some(delay) = dump_delay() {
                        std::thread::sleep(delay);
                    }
                    if let Err(e) = write_ppm(Path::new(arg), frame_color(*presses)) {
                        eprintln!("mock: screendump failed: {}", e);
                    }
                }
                "system_powerdown" => {
                    eprintln!("mock: powering down");
                    return true;
                }
                "quit" => return true,
                "" => {}
                other => eprintln!("mock: unknown command {}", other),
            }
            let _ = writer.write_all(b"(qemu) ");
        }
        false
    }

    fn dump_delay() -> Option<Duration> {
        let ms = std::env::var("MOCK_EMULATOR_DUMP_DELAY_MS").ok()?;
        ms.parse().ok().map(Duration::from_millis)
    }

    fn write_ppm(path: &Path, color: [u8; 3]) -> std::io::Result<()> {
        let mut data = format!("P6\n{} {}\n255\n", WIDTH, HEIGHT).into_bytes();
        for _ in 0..WIDTH * HEIGHT {
            data.extend_from_slice(&color);
        }
        // Written under a temp name so readers never see a partial image
        let tmp = path.with_extension("ppm.part");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, path)
    }
}
