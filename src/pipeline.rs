//! Programming run sequencing.
//!
//! A [`Pipeline`] owns the session for one run and walks a fixed list of
//! [`Step`]s, stopping at the first failure.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::flash::{NoProgress, ProgramImage, ProgressCallbacks};
use crate::protocol::{
    BLANK_CHECK_PAGE_COUNT, BLANK_CHECK_PAGE_SIZE, FLASH_BASE_ADDRESS, RAM_BASE_ADDRESS,
    WRITE_PAGE_SIZE,
};
use crate::{Error, Programmer, SerialPort};

/// Progress of a programming run, strictly forward
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Closed,
    Initialized,
    Synced,
    ShimActive,
    Erased,
    Verified,
    Programmed,
    Reset,
    Done,
    Failed,
}

/// Device memory layout used by a programming run
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Layout {
    /// Start of the flash region to blank check
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x00000000", parse(try_from_str = crate::parse_address))
    )]
    pub flash_base: u32,

    /// Size of each blank check window
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "512"))]
    pub blank_check_page_size: u16,

    /// Number of blank check windows
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "64"))]
    pub blank_check_pages: u32,

    /// Page size for program writes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "64"))]
    pub write_page_size: u16,

    /// RAM address the shim is loaded to and started from
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x20000000", parse(try_from_str = crate::parse_address))
    )]
    pub ram_base: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            flash_base: FLASH_BASE_ADDRESS,
            blank_check_page_size: BLANK_CHECK_PAGE_SIZE,
            blank_check_pages: BLANK_CHECK_PAGE_COUNT,
            write_page_size: WRITE_PAGE_SIZE,
            ram_base: RAM_BASE_ADDRESS,
        }
    }
}

impl Layout {
    /// Total bytes covered by the blank check
    pub fn flash_size(&self) -> u32 {
        self.blank_check_page_size as u32 * self.blank_check_pages
    }
}

/// One stage of a programming run
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Open,
    Handshake,
    LoadShim,
    ChipErase,
    BlankCheck,
    WriteImage,
    Reset,
}

impl Step {
    /// Steps executed against an open session, in order
    pub const SEQUENCE: [Step; 6] = [
        Step::Handshake,
        Step::LoadShim,
        Step::ChipErase,
        Step::BlankCheck,
        Step::WriteImage,
        Step::Reset,
    ];

    /// State entered once this step succeeds
    pub fn reached(&self) -> State {
        match self {
            Step::Open => State::Initialized,
            Step::Handshake => State::Synced,
            Step::LoadShim => State::ShimActive,
            Step::ChipErase => State::Erased,
            Step::BlankCheck => State::Verified,
            Step::WriteImage => State::Programmed,
            Step::Reset => State::Reset,
        }
    }

    /// Run this step on `programmer`, for steps in [`Step::SEQUENCE`]
    fn execute<P, D, E>(
        &self,
        programmer: &mut Programmer<P, D, E>,
        job: &Job<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: fmt::Debug,
    {
        let layout = &job.layout;

        match self {
            // Opened by `Pipeline::run` before the sequence starts
            Step::Open => Ok(()),
            Step::Handshake => programmer.handshake(),
            Step::LoadShim => programmer.load_shim(job.shim, layout.ram_base),
            Step::ChipErase => programmer.chip_erase(),
            Step::BlankCheck => programmer.blank_check(
                layout.flash_base,
                layout.blank_check_page_size,
                layout.blank_check_pages,
            ),
            Step::WriteImage => {
                programmer.write_image(job.image, layout.write_page_size, progress)
            }
            Step::Reset => programmer.reset_pulse(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Open => "open",
            Step::Handshake => "handshake",
            Step::LoadShim => "load shim",
            Step::ChipErase => "chip erase",
            Step::BlankCheck => "blank check",
            Step::WriteImage => "write image",
            Step::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Inputs of a programming run
#[derive(Clone, Debug)]
pub struct Job<'a> {
    pub shim: &'a [u8],
    pub image: &'a ProgramImage,
    pub layout: Layout,
}

/// First error of an aborted run
#[derive(Debug, thiserror::Error)]
#[error("{step} failed after reaching {reached:?}: {error}")]
pub struct Failure<E: fmt::Debug> {
    /// Step that failed
    pub step: Step,
    /// Last state reached before the failure
    pub reached: State,
    pub error: Error<E>,
}

pub struct Pipeline<'a> {
    job: Job<'a>,
    progress: Box<dyn ProgressCallbacks + 'a>,
    state: State,
    history: Vec<State>,
}

impl<'a> Pipeline<'a> {
    pub fn new(shim: &'a [u8], image: &'a ProgramImage, layout: Layout) -> Self {
        Self {
            job: Job {
                shim,
                image,
                layout,
            },
            progress: Box::new(NoProgress),
            state: State::Closed,
            history: vec![State::Closed],
        }
    }

    /// Report image write progress to `progress`
    pub fn with_progress(mut self, progress: impl ProgressCallbacks + 'a) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state entered so far, starting from `Closed`
    pub fn history(&self) -> &[State] {
        &self.history
    }

    /// Open a session with `open` and run every step against it
    ///
    /// The session is released on every exit path. Nothing is attempted after
    /// the first failure, and nothing already written is rolled back.
    pub fn run<P, D, E, F>(&mut self, open: F) -> Result<(), Failure<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: fmt::Debug,
        F: FnOnce() -> Result<Programmer<P, D, E>, Error<E>>,
    {
        let mut programmer = match open() {
            Ok(p) => p,
            Err(e) => return Err(self.fail(Step::Open, e)),
        };
        self.advance(Step::Open.reached());

        for step in Step::SEQUENCE.iter() {
            debug!("Running step: {}", step);

            if let Err(e) = step.execute(&mut programmer, &self.job, &mut *self.progress) {
                return Err(self.fail(*step, e));
            }
            self.advance(step.reached());
        }

        drop(programmer.close());
        self.advance(State::Done);

        info!("Programming complete");

        Ok(())
    }

    fn advance(&mut self, state: State) {
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    fn fail<E: fmt::Debug>(&mut self, step: Step, error: Error<E>) -> Failure<E> {
        error!("Step {} failed: {}", step, error);

        let reached = self.state;
        self.advance(State::Failed);

        Failure {
            step,
            reached,
            error,
        }
    }
}
