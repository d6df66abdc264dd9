mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{frame_address, hc32, is_frame, patched, programmer, shim, Reply, SimError};
use pretty_assertions::assert_eq;

use hc32_uart_loader::protocol::{HANDSHAKE_PATTERN, JUMP_COMMAND};
use hc32_uart_loader::{
    Error, Layout, Operation, Pipeline, ProgramImage, ProgressCallbacks, State, Step,
};

const ALL_STATES: [State; 9] = [
    State::Closed,
    State::Initialized,
    State::Synced,
    State::ShimActive,
    State::Erased,
    State::Verified,
    State::Programmed,
    State::Reset,
    State::Done,
];

#[test]
fn healthy_device_runs_to_done() {
    let (p, wire) = programmer(hc32());
    let shim = shim();
    let image = ProgramImage::new(0, (0..200).map(|v| v as u8).collect());

    let mut pipeline = Pipeline::new(&shim, &image, Layout::default());
    pipeline.run(move || Ok(p)).unwrap();

    assert_eq!(pipeline.state(), State::Done);
    assert_eq!(pipeline.history(), &ALL_STATES[..]);

    let wire = wire.borrow();
    let requests = wire.requests();

    assert_eq!(requests[0], HANDSHAKE_PATTERN.to_vec());
    assert!(is_frame(&requests[1], 0x00));
    assert_eq!(requests[3], JUMP_COMMAND.to_vec());
    assert!(is_frame(&requests[4], 0x02));

    // 64 blank check windows of 512 bytes, then 4 page writes
    let blank = wire.frames(0x07);
    assert_eq!(blank.len(), 64);
    assert_eq!(frame_address(&blank[63]), 63 * 512);
    assert_eq!(wire.frames(0x04).len(), 4);
    assert_eq!(requests.len(), 5 + 64 + 4);

    assert!(wire.closed);
}

#[test]
fn bad_erase_checksum_aborts_before_flash_access() {
    let device = patched(hc32(), |request, mut reply| {
        if is_frame(request, 0x02) {
            reply.bytes[8] ^= 0x01;
        }
        reply
    });
    let (p, wire) = programmer(device);
    let shim = shim();
    let image = ProgramImage::new(0, vec![0x00; 128]);

    let mut pipeline = Pipeline::new(&shim, &image, Layout::default());
    let failure = pipeline.run(move || Ok(p)).unwrap_err();

    assert_eq!(failure.step, Step::ChipErase);
    assert_eq!(failure.reached, State::ShimActive);
    match failure.error {
        Error::Protocol { operation, .. } => assert_eq!(operation, Operation::ChipErase),
        other => panic!("Did not expect: {:?}", other),
    }

    assert_eq!(pipeline.state(), State::Failed);
    assert_eq!(
        pipeline.history(),
        &[
            State::Closed,
            State::Initialized,
            State::Synced,
            State::ShimActive,
            State::Failed
        ][..]
    );

    let wire = wire.borrow();
    assert!(wire.frames(0x07).is_empty());
    assert!(wire.frames(0x04).is_empty());
    assert!(wire.closed);
}

#[test]
fn open_failure_is_reported_as_open_step() {
    let shim = shim();
    let image = ProgramImage::new(0, vec![0x00; 16]);

    let mut pipeline = Pipeline::new(&shim, &image, Layout::default());
    let failure = pipeline
        .run::<common::SimPort, common::SimDelay, SimError, _>(|| {
            Err(Error::Io(std::io::ErrorKind::NotFound))
        })
        .unwrap_err();

    assert_eq!(failure.step, Step::Open);
    assert_eq!(failure.reached, State::Closed);
    assert_eq!(pipeline.history(), &[State::Closed, State::Failed][..]);
}

#[test]
fn silent_device_fails_handshake_only() {
    let (p, wire) = programmer(Box::new(|_: &[u8]| Reply::silent()));
    let shim = shim();
    let image = ProgramImage::new(0, vec![0x00; 16]);

    let mut pipeline = Pipeline::new(&shim, &image, Layout::default());
    let failure = pipeline.run(move || Ok(p)).unwrap_err();

    assert_eq!(failure.step, Step::Handshake);
    assert_eq!(
        failure.error,
        Error::Timeout {
            expected: 1,
            received: vec![]
        }
    );
    assert_eq!(wire.borrow().requests().len(), 1);
    assert!(wire.borrow().closed);
}

#[test]
fn layout_drives_blank_check_and_page_size() {
    let (p, wire) = programmer(hc32());
    let shim = shim();
    let image = ProgramImage::new(0x800, vec![0x11; 100]);
    let layout = Layout {
        flash_base: 0x800,
        blank_check_page_size: 256,
        blank_check_pages: 3,
        write_page_size: 32,
        ..Layout::default()
    };

    let mut pipeline = Pipeline::new(&shim, &image, layout);
    pipeline.run(move || Ok(p)).unwrap();

    let wire = wire.borrow();
    assert_eq!(
        wire.frames(0x07)
            .iter()
            .map(|f| frame_address(f))
            .collect::<Vec<_>>(),
        vec![0x800, 0x900, 0xA00]
    );
    assert_eq!(
        wire.frames(0x04)
            .iter()
            .map(|f| frame_address(f))
            .collect::<Vec<_>>(),
        vec![0x800, 0x820, 0x840, 0x860]
    );
}

struct Pages(Rc<RefCell<Vec<usize>>>);

impl ProgressCallbacks for Pages {
    fn init(&mut self, _addr: u32, _total: usize) {}

    fn update(&mut self, current: usize) {
        self.0.borrow_mut().push(current);
    }

    fn finish(&mut self) {}
}

#[test]
fn pipeline_forwards_write_progress() {
    let (p, _wire) = programmer(hc32());
    let shim = shim();
    let image = ProgramImage::new(0, vec![0x00; 130]);
    let seen = Rc::new(RefCell::new(vec![]));

    let mut pipeline =
        Pipeline::new(&shim, &image, Layout::default()).with_progress(Pages(seen.clone()));
    pipeline.run(move || Ok(p)).unwrap();

    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}
