//! warp-shmd - shared-memory tensor store daemon and inspection tool

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use warp_shm::{
    init_logging, read_worker_args, ClientConfig, DataType, Element, ForkingCodec, LogConfig,
    LogLevel, ObjectId, PutOptions, StoreClient, StoreConfig, StoreServer, Tensor, TransportHook,
};

#[derive(Parser)]
#[command(name = "warp-shmd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Store endpoint (defaults to $WARP_SHM_SOCKET, then /tmp/warp-shm.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the store daemon
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Arena directory for segment files
        #[arg(long)]
        shm_dir: Option<PathBuf>,
        /// Capacity in bytes
        #[arg(long)]
        capacity: Option<u64>,
    },
    /// List stored identifiers
    List,
    /// Show store usage
    Stats,
    /// Print a stored tensor as JSON
    Get {
        /// Object identifier
        id: String,
    },
    /// Store a tensor given as comma-separated values
    Put {
        /// Object identifier
        id: String,
        /// Element dtype (int64, float32, ...)
        #[arg(long, default_value = "float32")]
        dtype: String,
        /// Comma-separated shape, e.g. 2,3
        #[arg(long, value_delimiter = ',')]
        shape: Vec<usize>,
        /// Comma-separated row-major values
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        values: Vec<String>,
    },
    /// Overwrite every element of a stored tensor in place
    Fill {
        /// Object identifier
        id: String,
        /// New element value
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Remove an identifier from the store
    Delete {
        /// Object identifier
        id: String,
    },
    /// Decode named tensors sent by a parent process on stdin and print them
    Worker {
        /// Fill every received tensor with this value before printing
        #[arg(long, allow_hyphen_values = true)]
        fill: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig {
        level: LogLevel::from_verbosity(cli.verbose),
        ..Default::default()
    })?;

    let client_config = match &cli.socket {
        Some(path) => ClientConfig::with_socket(path),
        None => ClientConfig::from_env(),
    };

    match cli.command {
        Commands::Serve {
            config,
            shm_dir,
            capacity,
        } => serve(cli.socket, config, shm_dir, capacity),
        Commands::List => {
            let client = StoreClient::connect(client_config)?;
            for id in client.list()? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Stats => {
            let client = StoreClient::connect(client_config)?;
            println!("{}", serde_json::to_string(&client.stats()?)?);
            Ok(())
        }
        Commands::Get { id } => {
            let client = StoreClient::connect(client_config)?;
            let id = ObjectId::new(id)?;
            let tensor = client.get_tensor(&id)?;
            println!("{}", tensor_json(id.as_str(), &tensor)?);
            Ok(())
        }
        Commands::Put {
            id,
            dtype,
            shape,
            values,
        } => {
            let client = StoreClient::connect(client_config)?;
            let id = ObjectId::new(id)?;
            let tensor = parse_tensor(DataType::parse(&dtype)?, &shape, &values)?;
            client.put_tensor(&id, &tensor, PutOptions::default())?;
            println!("{id}");
            Ok(())
        }
        Commands::Fill { id, value } => {
            let client = StoreClient::connect(client_config)?;
            let mut view = client.get_tensor(&ObjectId::new(id)?)?;
            fill(&mut view, &value)
        }
        Commands::Delete { id } => {
            let client = StoreClient::connect(client_config)?;
            client.delete(&ObjectId::new(id)?)?;
            Ok(())
        }
        Commands::Worker { fill: fill_value } => worker(client_config, fill_value.as_deref()),
    }
}

fn serve(
    socket: Option<PathBuf>,
    config_path: Option<PathBuf>,
    shm_dir: Option<PathBuf>,
    capacity: Option<u64>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(dir) = shm_dir {
        config.shm_dir = dir;
    }
    if let Some(capacity) = capacity {
        config.capacity_bytes = capacity;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let server = StoreServer::bind(config).await?;
        server.run().await
    })?;
    Ok(())
}

fn worker(client_config: ClientConfig, fill_value: Option<&str>) -> Result<()> {
    let client = Arc::new(StoreClient::connect(client_config)?);
    let codec = ForkingCodec::new();
    codec.register(TransportHook::new(client));

    let args: Vec<(String, Tensor)> = read_worker_args(&codec, std::io::stdin().lock())?;
    let mut out = Vec::with_capacity(args.len());
    for (name, mut tensor) in args {
        if let Some(value) = fill_value {
            fill(&mut tensor, value)?;
        }
        out.push(tensor_json(&name, &tensor)?);
    }
    println!("{}", Value::Array(out));
    Ok(())
}

fn tensor_json(name: &str, tensor: &Tensor) -> Result<Value> {
    Ok(json!({
        "id": name,
        "dtype": tensor.dtype().to_string(),
        "device": tensor.device().to_string(),
        "shape": tensor.shape(),
        "strides": tensor.strides(),
        "values": nest(&flat_values(tensor)?, tensor.shape()),
    }))
}

fn flat_values(tensor: &Tensor) -> Result<Vec<Value>> {
    fn values_of<T: Element + serde::Serialize>(tensor: &Tensor) -> Result<Vec<Value>> {
        tensor
            .as_slice::<T>()?
            .iter()
            .map(|v| serde_json::to_value(v).map_err(Into::into))
            .collect()
    }

    match tensor.dtype() {
        DataType::BOOL => Ok(tensor.as_bytes().iter().map(|&b| Value::Bool(b != 0)).collect()),
        DataType::INT8 => values_of::<i8>(tensor),
        DataType::INT16 => values_of::<i16>(tensor),
        DataType::INT32 => values_of::<i32>(tensor),
        DataType::INT64 => values_of::<i64>(tensor),
        DataType::UINT8 => values_of::<u8>(tensor),
        DataType::UINT16 => values_of::<u16>(tensor),
        DataType::UINT32 => values_of::<u32>(tensor),
        DataType::UINT64 => values_of::<u64>(tensor),
        DataType::FLOAT32 => values_of::<f32>(tensor),
        DataType::FLOAT64 => values_of::<f64>(tensor),
        other => bail!("cannot print elements of dtype {other}"),
    }
}

fn nest(flat: &[Value], shape: &[usize]) -> Value {
    match shape.split_first() {
        None => flat.first().cloned().unwrap_or(Value::Null),
        Some((&extent, rest)) => {
            let step: usize = rest.iter().product();
            Value::Array(
                (0..extent)
                    .map(|i| nest(&flat[i * step..(i + 1) * step], rest))
                    .collect(),
            )
        }
    }
}

fn parse_one<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value {value:?}: {e}"))
}

fn parse_bool(value: &str) -> Result<u8> {
    match value.trim() {
        "true" | "1" => Ok(1),
        "false" | "0" => Ok(0),
        other => bail!("invalid bool {other:?}"),
    }
}

fn parse_tensor(dtype: DataType, shape: &[usize], values: &[String]) -> Result<Tensor> {
    fn build<T>(shape: &[usize], values: &[String]) -> Result<Tensor>
    where
        T: Element + FromStr,
        T::Err: Display,
    {
        let data = values
            .iter()
            .map(|v| parse_one::<T>(v))
            .collect::<Result<Vec<T>>>()?;
        Ok(Tensor::from_vec(shape, data)?)
    }

    let numel: usize = shape.iter().product();
    if values.len() != numel {
        bail!("shape {shape:?} needs {numel} values, got {}", values.len());
    }

    match dtype {
        DataType::BOOL => {
            let bytes = values
                .iter()
                .map(|v| parse_bool(v))
                .collect::<Result<Vec<u8>>>()?;
            let meta = warp_shm::TensorMeta::contiguous(warp_shm::Device::CPU, dtype, shape);
            Ok(Tensor::from_bytes(meta, &bytes)?)
        }
        DataType::INT8 => build::<i8>(shape, values),
        DataType::INT16 => build::<i16>(shape, values),
        DataType::INT32 => build::<i32>(shape, values),
        DataType::INT64 => build::<i64>(shape, values),
        DataType::UINT8 => build::<u8>(shape, values),
        DataType::UINT16 => build::<u16>(shape, values),
        DataType::UINT32 => build::<u32>(shape, values),
        DataType::UINT64 => build::<u64>(shape, values),
        DataType::FLOAT32 => build::<f32>(shape, values),
        DataType::FLOAT64 => build::<f64>(shape, values),
        other => bail!("cannot parse elements of dtype {other}"),
    }
}

fn fill(tensor: &mut Tensor, value: &str) -> Result<()> {
    match tensor.dtype() {
        DataType::BOOL => {
            let byte = parse_bool(value)?;
            tensor.as_bytes_mut().fill(byte);
            Ok(())
        }
        DataType::INT8 => Ok(tensor.fill(parse_one::<i8>(value)?)?),
        DataType::INT16 => Ok(tensor.fill(parse_one::<i16>(value)?)?),
        DataType::INT32 => Ok(tensor.fill(parse_one::<i32>(value)?)?),
        DataType::INT64 => Ok(tensor.fill(parse_one::<i64>(value)?)?),
        DataType::UINT8 => Ok(tensor.fill(parse_one::<u8>(value)?)?),
        DataType::UINT16 => Ok(tensor.fill(parse_one::<u16>(value)?)?),
        DataType::UINT32 => Ok(tensor.fill(parse_one::<u32>(value)?)?),
        DataType::UINT64 => Ok(tensor.fill(parse_one::<u64>(value)?)?),
        DataType::FLOAT32 => Ok(tensor.fill(parse_one::<f32>(value)?)?),
        DataType::FLOAT64 => Ok(tensor.fill(parse_one::<f64>(value)?)?),
        other => bail!("cannot fill elements of dtype {other}"),
    }
}
