use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::debug;

use bfkit::codegen::{self, Target};
use bfkit::interpreter::{run_direct, run_ir, Session};
use bfkit::parser::insert_top_break_point;
use bfkit::{jit, parse, trim, Error, Tape, DEFAULT_HEAP_SIZE};

fn cli() -> Command {
    Command::new("bfkit")
        .about("Optimizing brainfuck compiler and execution engine")
        .disable_version_flag(true)
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .help("Show version")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("eval")
                .short('e')
                .long("eval")
                .value_name("CODE")
                .help("Use CODE as the source instead of reading a file"),
        )
        .arg(
            Arg::new("minify")
                .short('m')
                .long("minify")
                .help("Remove all non-brainfuck characters from source code")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file name for --target"),
        )
        .arg(
            Arg::new("target")
                .short('t')
                .long("target")
                .value_name("TARGET")
                .help(
                    "Compile for the specified target instead of executing\n\
                     - c:          Transpile to C source\n\
                     - xbyakc:     Dump the JIT assembler output as C source\n\
                     - winx86:     Compile to x86 EXE binary\n\
                     - winx64:     Compile to x64 EXE binary\n\
                     - elfx86:     Compile to x86 ELF binary\n\
                     - elfx64:     Compile to x64 ELF binary\n\
                     - elfarmeabi: Compile to ARM EABI ELF binary",
                ),
        )
        .arg(
            Arg::new("optimize")
                .short('O')
                .long("optimize")
                .value_name("LEVEL")
                .default_value("1")
                .value_parser(clap::value_parser!(u32))
                .help(
                    "Optimization level\n\
                     - 0: Execute the source directly\n\
                     - 1: Compile to IR code and execute\n\
                     - 2: Compile to native code and execute",
                ),
        )
        .arg(
            Arg::new("dump-ir")
                .long("dump-ir")
                .help("Dump IR code")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("heap-size")
                .long("heap-size")
                .value_name("HEAP_SIZE")
                .default_value("65536")
                .value_parser(clap::value_parser!(usize))
                .help("Tape length"),
        )
        .arg(
            Arg::new("top-break-point")
                .long("top-break-point")
                .help("Insert a breakpoint before the program")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("enable-synchronize-with-stdio")
                .long("enable-synchronize-with-stdio")
                .help("Flush stdout after every output byte")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("FILE")
                .help("Brainfuck source file, or - for stdin")
                .index(1),
        )
}

fn main() {
    env_logger::init();
    let matches = cli().get_matches();

    if matches.get_flag("version") {
        println!("<<< bfkit >>>\n");
        println!("Version: {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(err) = run(&matches) {
        eprintln!("{}", err);
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), Error> {
    let heap_size = *matches
        .get_one::<usize>("heap-size")
        .unwrap_or(&DEFAULT_HEAP_SIZE);
    let level = *matches.get_one::<u32>("optimize").unwrap_or(&1);

    let file = matches.get_one::<String>("FILE").map(String::as_str);
    let source = load_source(matches.get_one::<String>("eval"), file)?;

    if matches.get_flag("minify") {
        println!("{}", trim(&source));
        return Ok(());
    }

    let mut ir = parse(source.as_bytes())?;
    if matches.get_flag("top-break-point") {
        insert_top_break_point(&mut ir);
    }
    debug!("compiled {} ir instructions", ir.len());

    if matches.get_flag("dump-ir") {
        println!("{:#?}", ir);
        return Ok(());
    }

    if let Some(target_name) = matches.get_one::<String>("target") {
        let target: Target = target_name.parse()?;
        let out_name = match matches.get_one::<String>("output") {
            Some(name) => name.clone(),
            None => default_output_name(file, target),
        };
        let bytes = codegen::emit_to_vec(target, &ir, heap_size);
        debug!("emitting {} bytes for target {}", bytes.len(), target);

        let mut out = File::create(&out_name).map_err(Error::io(&out_name))?;
        out.write_all(&bytes).map_err(Error::io(&out_name))?;
        #[cfg(unix)]
        if target.is_executable() {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = out
                .metadata()
                .map_err(Error::io(&out_name))?
                .permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            out.set_permissions(permissions).map_err(Error::io(&out_name))?;
        }
        return Ok(());
    }

    let mut tape = Tape::new(heap_size);
    let flush_putchar = matches.get_flag("enable-synchronize-with-stdio");

    if level >= 2 {
        return jit::run(&ir, &mut tape, flush_putchar);
    }

    let mut stdin = io::stdin();
    let mut stdout = io::BufWriter::new(io::stdout());
    let mut session = Session::new(&mut stdin, &mut stdout);
    session.flush_putchar = flush_putchar;

    if level == 0 {
        let trimmed = trim(&source);
        run_direct(trimmed.as_bytes(), &mut tape, &mut session)
    } else {
        run_ir(&ir, &mut tape, &mut session)
    }
}

fn load_source(eval: Option<&String>, file: Option<&str>) -> Result<String, Error> {
    if let Some(code) = eval {
        return Ok(code.clone());
    }
    match file {
        Some("-") => {
            let mut source = String::new();
            io::stdin()
                .read_to_string(&mut source)
                .map_err(Error::io("<stdin>"))?;
            Ok(source)
        }
        Some(path) => std::fs::read_to_string(path).map_err(Error::io(path)),
        None => Err(Error::MissingInput),
    }
}

/// Basename of the input with the target's suffix; `a.c`/`a.exe`/`a.out`
/// when the source came from --eval or stdin.
fn default_output_name(file: Option<&str>, target: Target) -> String {
    let base = match file {
        Some("-") | None => "a".to_string(),
        Some(path) => {
            let name = Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "a".to_string());
            match name.rfind('.') {
                Some(pos) if pos > 0 => name[..pos].to_string(),
                _ => name,
            }
        }
    };
    format!("{}{}", base, target.suffix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_names_follow_the_target() {
        assert_eq!(default_output_name(Some("mandel.b"), Target::C), "mandel.c");
        assert_eq!(
            default_output_name(Some("dir/mandel.b"), Target::ElfX64),
            "mandel.out"
        );
        assert_eq!(
            default_output_name(Some("hello.bf"), Target::WinX86),
            "hello.exe"
        );
        assert_eq!(default_output_name(Some("-"), Target::ElfX86), "a.out");
        assert_eq!(default_output_name(None, Target::XbyakC), "a.c");
        assert_eq!(
            default_output_name(Some(".hidden"), Target::C),
            ".hidden.c"
        );
    }
}
