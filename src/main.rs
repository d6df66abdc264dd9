#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::Write as _;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use hc32_uart_loader::image::{load_elf, load_raw};
use hc32_uart_loader::{parse_address, Layout, Options, Pipeline, Programmer, ProgressCallbacks};

const WIRING: &str = "Please connect the serial port and MCU as such:
Serial.DTR/RTS => MCU.P00/RESET
Serial.V+      => MCU.V+ (6)
Serial.GND     => MCU.GND (4)
Serial.RXD     => MCU.P31 (15)
Serial.TXD     => MCU.P27 (14)
OR
Serial.RXD     => MCU.P35 (19)
Serial.TXD     => MCU.P36 (20)";

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    action: Action,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Action {
    /// Download a program to the MCU flash
    Download {
        /// ELF executable to program, or a flat binary with --raw
        #[structopt(parse(from_os_str))]
        image: PathBuf,

        /// Serial port to connect to
        port: String,

        /// Image is a raw binary (e.g. from objcopy) rather than an ELF file
        #[structopt(long)]
        raw: bool,

        /// Load address, only used with --raw (ELF images load at their .text address)
        #[structopt(long, default_value = "0x00000000", parse(try_from_str = parse_address))]
        address: u32,

        /// Flash loader shim executed from RAM
        #[structopt(long, parse(from_os_str))]
        shim: PathBuf,

        /// Serial port baud rate
        #[structopt(long, default_value = "9600")]
        baud: usize,

        #[structopt(flatten)]
        options: Options,

        #[structopt(flatten)]
        layout: Layout,
    },

    /// Reset the MCU and print its serial output
    Listen {
        /// Serial port to connect to
        port: String,

        /// Serial port baud rate
        #[structopt(long, default_value = "9600")]
        baud: usize,
    },

    /// Show MCU wiring information
    ShowConfig,
}

/// Progress bar over the pages of an image write
struct PageProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for PageProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {msg} [{bar:40}] {pos}/{len} pages")
                .progress_chars("=> "),
        );
        bar.set_message(&format!("0x{:08x}", addr));

        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    match o.action {
        Action::Download {
            image,
            port,
            raw,
            address,
            shim,
            baud,
            options,
            layout,
        } => download(image, port, raw, address, shim, baud, options, layout),
        Action::Listen { port, baud } => listen(&port, baud),
        Action::ShowConfig => {
            show_config();
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn download(
    image_path: PathBuf,
    port: String,
    raw: bool,
    address: u32,
    shim_path: PathBuf,
    baud: usize,
    options: Options,
    layout: Layout,
) -> anyhow::Result<()> {
    let shim = std::fs::read(&shim_path)
        .with_context(|| format!("Error reading shim {}", shim_path.display()))?;

    let image = if raw {
        load_raw(&image_path, address)?
    } else {
        load_elf(&image_path)?
    };

    info!(
        "Programming {} ({}) at 0x{:08x} over {}",
        image_path.display(),
        bytefmt::format(image.len() as u64),
        image.load_address,
        port
    );

    let mut pipeline =
        Pipeline::new(&shim, &image, layout).with_progress(PageProgress { bar: None });

    pipeline
        .run(|| Programmer::linux(&port, baud, options))
        .with_context(|| format!("Error uploading {} over {}", image_path.display(), port))?;

    info!("Device programmed and reset");

    Ok(())
}

fn listen(port: &str, baud: usize) -> anyhow::Result<()> {
    info!("Connecting to serial port");

    let mut p = Programmer::linux(port, baud, Options::default())
        .with_context(|| format!("Error connecting to serial port {}", port))?;

    p.reset_pulse()?;
    info!("MCU reset, listening on {}", port);

    let stdout = std::io::stdout();
    loop {
        let data = p.read_available()?;
        if data.is_empty() {
            sleep(Duration::from_millis(10));
            continue;
        }

        let mut out = stdout.lock();
        out.write_all(&data)?;
        out.flush()?;
    }
}

fn show_config() {
    let layout = Layout::default();

    println!("{}", WIRING);
    println!();
    println!(
        "Flash: 0x{:08x}, {} ({} x {} byte blank check windows)",
        layout.flash_base,
        bytefmt::format(layout.flash_size() as u64),
        layout.blank_check_pages,
        layout.blank_check_page_size
    );
    println!("Write page size: {} bytes", layout.write_page_size);
    println!("Shim RAM base: 0x{:08x}", layout.ram_base);
}
