use std::io;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{info, warn};
use wordjit::logging;
use wordjit::{CallOutcome, HostFunction, JitConfig, Program, Value, Vm, VmError, VmStatus, assemble};

const JIT_ENV: &str = "WORDJIT_JIT";
const CODE_CAPACITY_ENV: &str = "WORDJIT_CODE_CAPACITY";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    jit: Option<bool>,
    code_capacity: Option<usize>,
    dump: bool,
    dump_json: bool,
    repl: bool,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("info")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    let jit = jit_config(&cli, |key| std::env::var(key).ok()).map_err(io::Error::other)?;
    if cli.repl {
        return run_repl(&jit);
    }

    let Some(path) = cli.source.as_deref() else {
        print_usage();
        return Err(Box::new(io::Error::other("missing source file")));
    };
    let source = std::fs::read_to_string(path)?;
    let program = assemble(&source)?;
    let mut vm = build_vm(program, &jit);
    run_to_completion(&mut vm)?;
    if let Some(value) = vm.stack().last() {
        println!("=> {}", format_value(value));
    }
    if cli.dump {
        print!("{}", vm.dump_jit_info());
    }
    if cli.dump_json {
        match vm.native_code_handle() {
            Some(native) => println!("{}", native.listing().to_json()?),
            None => warn!("{} no native code to dump", logging::category_codegen()),
        }
    }
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    if args.is_empty() {
        cfg.repl = true;
        return Ok(cfg);
    }
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => cfg.help = true,
            "--repl" => cfg.repl = true,
            "--jit" => cfg.jit = Some(true),
            "--no-jit" => cfg.jit = Some(false),
            "--dump" => cfg.dump = true,
            "--dump-json" => cfg.dump_json = true,
            "--code-capacity" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --code-capacity".to_string())?;
                cfg.code_capacity = Some(parse_capacity(raw)?);
                index += 1;
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag '{flag}'")),
            path => {
                if cfg.source.is_some() {
                    return Err(format!("unexpected argument '{path}'"));
                }
                cfg.source = Some(path.to_string());
            }
        }
        index += 1;
    }
    Ok(cfg)
}

/// Flags override the environment, which overrides the defaults.
fn jit_config(
    cli: &CliConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<JitConfig, String> {
    let mut config = JitConfig::default();
    if let Some(raw) = env(JIT_ENV) {
        config.enabled = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            other => return Err(format!("invalid {JIT_ENV} value '{other}'")),
        };
    }
    if let Some(raw) = env(CODE_CAPACITY_ENV) {
        config.initial_capacity_words = parse_capacity(&raw)?;
    }
    if let Some(enabled) = cli.jit {
        config.enabled = enabled;
    }
    if let Some(words) = cli.code_capacity {
        config.initial_capacity_words = words;
    }
    Ok(config)
}

fn parse_capacity(raw: &str) -> Result<usize, String> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid code capacity '{raw}'"))
}

fn print_usage() {
    println!("usage: wordjit-run [options] <program.wjasm>");
    println!("       wordjit-run            (starts the REPL)");
    println!();
    println!("options:");
    println!("  --jit / --no-jit         force native compilation on or off");
    println!("  --code-capacity WORDS    initial code buffer size");
    println!("  --dump                   print the native code listing after the run");
    println!("  --dump-json              print the native code listing as JSON");
    println!("  --repl                   read assembly interactively");
    println!();
    println!("environment: {JIT_ENV}, {CODE_CAPACITY_ENV}, RUST_LOG");
    println!("host functions: 0 print, 1 add_one, 2 echo");
}

fn build_vm(program: Program, jit: &JitConfig) -> Vm {
    let mut vm = Vm::new(program);
    vm.set_jit_config(jit.clone());
    vm.register_function(Box::new(PrintFunction));
    vm.register_function(Box::new(AddOneFunction));
    vm.register_function(Box::new(EchoFunction));
    vm
}

fn run_to_completion(vm: &mut Vm) -> Result<(), VmError> {
    let status = loop {
        let status = vm.run()?;
        match status {
            VmStatus::Halted => break status,
            VmStatus::Yielded => info!(
                ip = vm.ip(),
                "{}, resuming",
                logging::status_label(status.code())
            ),
        }
    };
    let category = if vm.native_exec_count() > 0 {
        logging::category_native()
    } else {
        logging::category_interp()
    };
    info!(
        "{category} {} after {} native entries",
        logging::status_label(status.code()),
        vm.native_exec_count()
    );
    Ok(())
}

fn run_repl(jit: &JitConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("wordjit REPL");
    println!("enter assembly lines, then :run; also :dump, :list, :clear, :quit");
    let mut editor = DefaultEditor::new()?;
    let mut buffer: Vec<String> = Vec::new();
    let mut last: Option<Vm> = None;
    loop {
        match editor.readline("wordjit> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match line {
                    ":quit" | ":q" => break,
                    ":clear" => {
                        buffer.clear();
                        last = None;
                    }
                    ":list" => {
                        for (index, line) in buffer.iter().enumerate() {
                            println!("{:>4}  {line}", index + 1);
                        }
                    }
                    ":dump" => match &last {
                        Some(vm) => print!("{}", vm.dump_jit_info()),
                        None => println!("nothing has run yet"),
                    },
                    ":run" => {
                        let program = match assemble(&buffer.join("\n")) {
                            Ok(program) => program,
                            Err(err) => {
                                println!("{err}");
                                continue;
                            }
                        };
                        let mut vm = build_vm(program, jit);
                        match run_to_completion(&mut vm) {
                            Ok(()) => match vm.stack().last() {
                                Some(value) => println!("=> {}", format_value(value)),
                                None => println!("=> <empty>"),
                            },
                            Err(err) => println!("runtime error: {err}"),
                        }
                        last = Some(vm);
                    }
                    command if command.starts_with(':') => {
                        println!("unknown command '{command}'");
                    }
                    _ => buffer.push(line.to_string()),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => return Err(Box::new(io::Error::other(err.to_string()))),
        }
    }
    Ok(())
}

struct PrintFunction;

impl HostFunction for PrintFunction {
    fn call(&mut self, _vm: &mut Vm, args: &[Value]) -> Result<CallOutcome, VmError> {
        let rendered = args.iter().map(format_value).collect::<Vec<_>>().join(" ");
        println!("{rendered}");
        Ok(CallOutcome::Return(Vec::new()))
    }
}

struct AddOneFunction;

impl HostFunction for AddOneFunction {
    fn call(&mut self, _vm: &mut Vm, args: &[Value]) -> Result<CallOutcome, VmError> {
        match args.first() {
            Some(Value::Int(value)) => Ok(CallOutcome::Return(vec![Value::Int(value.wrapping_add(1))])),
            _ => Err(VmError::TypeMismatch("int")),
        }
    }
}

struct EchoFunction;

impl HostFunction for EchoFunction {
    fn call(&mut self, _vm: &mut Vm, args: &[Value]) -> Result<CallOutcome, VmError> {
        Ok(CallOutcome::Return(args.to_vec()))
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Int(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Bool(value) => value.to_string(),
        Value::String(value) => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn no_arguments_starts_the_repl() {
        let cfg = parse_cli_args(&[]).expect("parse should succeed");
        assert!(cfg.repl);
        assert!(cfg.source.is_none());
        assert!(cfg.jit.is_none());
    }

    #[test]
    fn flags_and_source_are_parsed() {
        let cfg = parse_cli_args(&[
            s("--no-jit"),
            s("--code-capacity"),
            s("1024"),
            s("--dump"),
            s("loop.wjasm"),
        ])
        .expect("parse should succeed");
        assert_eq!(cfg.jit, Some(false));
        assert_eq!(cfg.code_capacity, Some(1024));
        assert!(cfg.dump);
        assert!(!cfg.dump_json);
        assert_eq!(cfg.source.as_deref(), Some("loop.wjasm"));
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(parse_cli_args(&[s("--code-capacity")]).is_err());
        assert!(parse_cli_args(&[s("--code-capacity"), s("lots")]).is_err());
        assert!(parse_cli_args(&[s("--bogus")]).is_err());
        assert!(parse_cli_args(&[s("a.wjasm"), s("b.wjasm")]).is_err());
    }

    #[test]
    fn flags_override_environment() {
        let env = |key: &str| match key {
            JIT_ENV => Some(s("off")),
            CODE_CAPACITY_ENV => Some(s("64")),
            _ => None,
        };
        let from_env = jit_config(&CliConfig::default(), env).expect("config");
        assert!(!from_env.enabled);
        assert_eq!(from_env.initial_capacity_words, 64);

        let cli = CliConfig {
            jit: Some(true),
            code_capacity: Some(512),
            ..CliConfig::default()
        };
        let from_flags = jit_config(&cli, env).expect("config");
        assert!(from_flags.enabled);
        assert_eq!(from_flags.initial_capacity_words, 512);
    }

    #[test]
    fn invalid_environment_is_an_error() {
        let env = |key: &str| (key == JIT_ENV).then(|| s("maybe"));
        assert!(jit_config(&CliConfig::default(), env).is_err());
    }
}
