use std::error::Error;
use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::Rng;

use int_ext_sort::{
    check_sorted, ByteOrder, RecordFormat, RecordReader, RecordWidth, RecordWriter, SortConfig, TrailingBytes,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let result = match arg_parser.subcommand() {
        Some(("sort", args)) => sort(args),
        Some(("generate", args)) => generate(args),
        Some(("verify", args)) => verify(args),
        Some(("dump", args)) => dump(args),
        _ => unreachable!("subcommand is required"),
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn sort(args: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = args.value_of("input").expect("value is required");
    let output = args.value_of("output").expect("value is required");
    let memory = args.value_of("memory").expect("value has default");
    let trailing: Trailing = args.value_of_t_or_exit("trailing");

    let config = SortConfig {
        record_width: record_width(args),
        byte_order: byte_order(args),
        memory_budget: memory.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        tmp_dir: args.value_of("tmp_dir").map(path::PathBuf::from),
        trailing_bytes: trailing.into(),
        threads_number: args
            .is_present("threads")
            .then(|| args.value_of_t_or_exit("threads")),
        rw_buf_size: args
            .value_of("buf_size")
            .map(|v| v.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize),
    };

    let stats = int_ext_sort::sort_file(config, path::Path::new(input), path::Path::new(output))?;
    if stats.truncated_bytes > 0 {
        log::warn!("{} trailing byte(s) of the input ignored", stats.truncated_bytes);
    }

    return Ok(());
}

fn generate(args: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
    let output = args.value_of("output").expect("value is required");
    let size = args.value_of("size").expect("value is required");
    let min: i64 = args.value_of_t_or_exit("min");
    let max: i64 = args.value_of_t_or_exit("max");
    if min > max {
        return Err(format!("minimum value {} is greater than maximum {}", min, max).into());
    }

    let format = RecordFormat::new(record_width(args), byte_order(args));
    let records = size.parse::<ByteSize>().expect("value is pre-validated").as_u64() / format.width() as u64;

    let output_stream = fs::File::create(output).map_err(|err| format!("output file creation error: {}", err))?;
    let mut output_writer = RecordWriter::new(io::BufWriter::new(output_stream), format);

    log::info!("generating {} records in range [{}, {}]", records, min, max);
    let mut rng = rand::thread_rng();
    for _ in 0..records {
        output_writer
            .write_record(rng.gen_range(min..=max))
            .map_err(|err| format!("data saving error: {}", err))?;
    }
    output_writer
        .flush()
        .map_err(|err| format!("data flushing error: {}", err))?;

    return Ok(());
}

fn verify(args: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = args.value_of("input").expect("value is required");
    let format = RecordFormat::new(record_width(args), byte_order(args));

    let input_stream = fs::File::open(input).map_err(|err| format!("input file opening error: {}", err))?;
    let report =
        check_sorted(io::BufReader::new(input_stream), format).map_err(|err| format!("data reading error: {}", err))?;

    match report.first_inversion {
        None => {
            log::info!("{} records sorted", report.records);
            Ok(())
        }
        Some(inversion) => Err(format!(
            "records not sorted: {} at position {} follows {}",
            inversion.current, inversion.position, inversion.previous
        )
        .into()),
    }
}

fn dump(args: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = args.value_of("input").expect("value is required");
    let limit: Option<u64> = args.is_present("limit").then(|| args.value_of_t_or_exit("limit"));
    let format = RecordFormat::new(record_width(args), byte_order(args));

    let input_stream = fs::File::open(input).map_err(|err| format!("input file opening error: {}", err))?;
    let mut output_stream: Box<dyn Write> = match args.value_of("output") {
        Some(output) => Box::new(io::BufWriter::new(
            fs::File::create(output).map_err(|err| format!("output file creation error: {}", err))?,
        )),
        None => Box::new(io::BufWriter::new(io::stdout())),
    };

    let mut records = RecordReader::new(io::BufReader::new(input_stream), format);
    let mut count = 0;
    while let Some(record) = records.read_record().map_err(|err| format!("data reading error: {}", err))? {
        if limit == Some(count) {
            output_stream.write_all(b"...\n")?;
            break;
        }
        output_stream.write_all(format!("{}\n", record).as_bytes())?;
        count += 1;
    }
    output_stream.flush()?;

    return Ok(());
}

fn record_width(args: &clap::ArgMatches) -> RecordWidth {
    let width: usize = args.value_of_t_or_exit("width");
    RecordWidth::from_bytes(width).expect("value is pre-validated")
}

fn byte_order(args: &clap::ArgMatches) -> ByteOrder {
    let byte_order: Order = args.value_of_t_or_exit("byte_order");
    byte_order.into()
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Little,
    Big,
    Native,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Order> for ByteOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::Little => ByteOrder::Little,
            Order::Big => ByteOrder::Big,
            Order::Native => ByteOrder::Native,
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Trailing {
    Reject,
    Truncate,
}

impl Trailing {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Trailing::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Trailing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Trailing as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Trailing> for TrailingBytes {
    fn from(trailing: Trailing) -> Self {
        match trailing {
            Trailing::Reject => TrailingBytes::Reject,
            Trailing::Truncate => TrailingBytes::Truncate,
        }
    }
}

fn validate_size(v: &str) -> Result<(), String> {
    match v.parse::<ByteSize>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn record_format_args() -> [clap::Arg<'static>; 2] {
    [
        clap::Arg::new("width")
            .short('w')
            .long("width")
            .help("record width in bytes")
            .takes_value(true)
            .default_value("4")
            .possible_values(["1", "2", "4", "8"]),
        clap::Arg::new("byte_order")
            .short('b')
            .long("byte-order")
            .help("records byte order")
            .takes_value(true)
            .default_value("native")
            .possible_values(Order::possible_values()),
    ]
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("int-ext-sort")
        .about("external sorter of binary integer files")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .subcommand(
            clap::App::new("sort")
                .about("sort records of a file")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("file to be sorted")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("result file")
                        .required(true)
                        .takes_value(true),
                )
                .args(record_format_args())
                .arg(
                    clap::Arg::new("memory")
                        .short('m')
                        .long("memory")
                        .help("memory budget of a single run")
                        .takes_value(true)
                        .default_value("100MiB")
                        .validator(validate_size),
                )
                .arg(
                    clap::Arg::new("trailing")
                        .long("trailing")
                        .help("handling of trailing bytes not forming a complete record")
                        .takes_value(true)
                        .default_value("reject")
                        .possible_values(Trailing::possible_values()),
                )
                .arg(
                    clap::Arg::new("threads")
                        .short('t')
                        .long("threads")
                        .help("number of threads to use for parallel sorting")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("tmp_dir")
                        .short('d')
                        .long("tmp-dir")
                        .help("directory to be used to store temporary data")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("buf_size")
                        .long("buf-size")
                        .help("runs read/write buffer size")
                        .takes_value(true)
                        .validator(validate_size),
                ),
        )
        .subcommand(
            clap::App::new("generate")
                .about("generate a file of random records")
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("file to be generated")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("size")
                        .short('s')
                        .long("size")
                        .help("file size")
                        .required(true)
                        .takes_value(true)
                        .validator(validate_size),
                )
                .args(record_format_args())
                .arg(
                    clap::Arg::new("min")
                        .long("min")
                        .help("minimum record value")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("0"),
                )
                .arg(
                    clap::Arg::new("max")
                        .long("max")
                        .help("maximum record value")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("1000000"),
                ),
        )
        .subcommand(
            clap::App::new("verify")
                .about("check that records of a file are sorted")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("file to be checked")
                        .required(true)
                        .takes_value(true),
                )
                .args(record_format_args()),
        )
        .subcommand(
            clap::App::new("dump")
                .about("print records of a file as decimal text, one per line")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("file to be printed")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("text file, standard output if omitted")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("limit")
                        .short('n')
                        .long("limit")
                        .help("maximum number of records to print")
                        .takes_value(true),
                )
                .args(record_format_args()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
