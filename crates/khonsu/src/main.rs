use std::io::Read;

use khonsu_compiler::compiler::{compile_with, CompileOptions};
use khonsu_compiler::disasm;

const USAGE: &str = "usage: khonsu [options] [script | -]
options:
  -l    list compiled bytecode (default)
  -p    parse only, report errors
  -g    generate debug information
  -n    print referenced global names
  -v    show version information
  --    stop handling options";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut script_file: Option<String> = None;
    let mut parse_only = false;
    let mut list = false;
    let mut debug_info = false;
    let mut show_globals = false;
    let mut show_version = false;
    let mut saw_dashdash = false;

    let mut i = 1;
    while i < args.len() {
        if saw_dashdash {
            script_file = Some(args[i].clone());
            break;
        }
        match args[i].as_str() {
            "--" => saw_dashdash = true,
            "-l" => list = true,
            "-p" => parse_only = true,
            "-g" => debug_info = true,
            "-n" => show_globals = true,
            "-v" => show_version = true,
            arg => {
                if arg.starts_with('-') && arg != "-" {
                    eprintln!("khonsu: unrecognized option '{arg}'");
                    eprintln!("{USAGE}");
                    std::process::exit(1);
                }
                script_file = Some(arg.to_string());
                break;
            }
        }
        i += 1;
    }

    if show_version {
        println!("Khonsu 0.1.0");
        if script_file.is_none() {
            return;
        }
    }

    let path = match script_file {
        Some(path) => path,
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let (source, chunk_name) = if path == "-" {
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("khonsu: cannot read stdin: {e}");
            std::process::exit(1);
        }
        (buf, "stdin".to_string())
    } else {
        match std::fs::read(&path) {
            Ok(data) => (data, path.clone()),
            Err(e) => {
                eprintln!("khonsu: cannot open {path}: {e}");
                std::process::exit(1);
            }
        }
    };

    let source = strip_shebang(&source);
    let options = CompileOptions { debug_info };
    let chunk = match compile_with(source, &chunk_name, options) {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("khonsu: {chunk_name}:{}: {}", e.line, e.message);
            std::process::exit(1);
        }
    };

    if !parse_only && (list || !show_globals) {
        print!("{}", disasm::disassemble(&chunk.proto, &chunk.strings));
    }

    if show_globals {
        for id in chunk.globals.iter() {
            println!("{}", String::from_utf8_lossy(chunk.strings.get_bytes(id)));
        }
    }
}

fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        if let Some(pos) = source.iter().position(|&b| b == b'\n') {
            &source[pos + 1..]
        } else {
            b""
        }
    } else {
        source
    }
}
