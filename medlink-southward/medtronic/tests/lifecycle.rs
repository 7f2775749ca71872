mod common;

use common::{basal_start, init_tracing, normal_bolus, pump, RecordingUpload};
use medlink_driver_medtronic::{
    driver::MedtronicConfig, protocol::packet::Opcode, MedtronicContext, MedtronicDriver,
};
use medlink_sdk::{run_lifecycle, DeltaMarkers, Event, Progress, TimeProcessing, UPLOAD_NAMESPACE};
use std::sync::{atomic::Ordering, Arc};

fn context(session: Arc<common::ScriptedPump>) -> MedtronicContext {
    MedtronicContext::new(MedtronicConfig::new("/dev/hidraw9", common::SERIAL)).with_session(session)
}

#[tokio::test]
async fn full_session_uploads_simulated_history() {
    init_tracing();
    let pump = pump("554", vec![basal_start(8, 40), normal_bolus(9, 40)]);
    let upload = Arc::new(RecordingUpload::default());
    let mut driver = MedtronicDriver::new(upload.clone());
    let mut ctx = context(pump.clone());

    run_lifecycle(&mut driver, &mut ctx, &Progress::noop())
        .await
        .unwrap();

    assert_eq!(ctx.device_id, "MedT-554-123456");
    assert_eq!(
        *pump.pages_requested.lock().unwrap(),
        vec![
            (Opcode::ReadHistory, 4),
            (Opcode::ReadCbgHistory, 2),
            (Opcode::ReadIsigHistory, 2),
        ]
    );

    let (events, session, namespace) = upload.submitted.lock().unwrap().clone().unwrap();
    assert_eq!(namespace, UPLOAD_NAMESPACE);
    assert_eq!(session.device_model, "554");
    assert_eq!(session.device_serial_number, "123456");
    assert_eq!(session.device_tags, vec!["insulin-pump".to_string()]);
    assert_eq!(session.device_time, "2016-11-14T23:00:00");
    assert_eq!(session.time_processing, TimeProcessing::AcrossTheBoardTimezone);
    assert_eq!(
        session.delta,
        DeltaMarkers {
            last_position: Some(3),
            last_cbg_position: Some(10),
            last_glucose_position: Some(1),
            last_isig_position: Some(1),
        }
    );

    assert!(matches!(events.first(), Some(Event::PumpSettings(_))));
    let basal = events
        .iter()
        .find_map(|e| match e {
            Event::Basal(b) => Some(b),
            _ => None,
        })
        .unwrap();
    assert_eq!(basal.rate, Some(1.0));
    assert_eq!(basal.schedule_name.as_deref(), Some("standard"));
    assert!(basal.duration > 0);

    let bolus = events
        .iter()
        .find_map(|e| match e {
            Event::Bolus(b) => Some(b),
            _ => None,
        })
        .unwrap();
    assert_eq!(bolus.normal, Some(1.0));

    let times: Vec<_> = events.iter().map(Event::time).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    assert!(pump.closed.load(Ordering::SeqCst));
    assert_eq!(pump.control_bytes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delta_upload_reads_only_new_pages() {
    init_tracing();
    let pump = pump("554", vec![basal_start(8, 40)]);
    let upload = Arc::new(RecordingUpload {
        previous: Some(DeltaMarkers {
            last_position: Some(3),
            last_cbg_position: Some(10),
            last_glucose_position: Some(1),
            last_isig_position: Some(1),
        }),
        ..Default::default()
    });
    let mut driver = MedtronicDriver::new(upload);
    let mut ctx = context(pump.clone());

    run_lifecycle(&mut driver, &mut ctx, &Progress::noop())
        .await
        .unwrap();

    let plan = ctx.plan.unwrap();
    assert!(!plan.first_upload);
    assert_eq!(
        *pump.pages_requested.lock().unwrap(),
        vec![
            (Opcode::ReadHistory, 1),
            (Opcode::ReadCbgHistory, 1),
            (Opcode::ReadIsigHistory, 1),
        ]
    );
}

#[tokio::test]
async fn unsupported_model_stops_before_fetch() {
    init_tracing();
    let pump = pump("512", vec![basal_start(8, 40)]);
    let upload = Arc::new(RecordingUpload::default());
    let mut driver = MedtronicDriver::new(upload.clone());
    let mut ctx = context(pump.clone());

    let err = run_lifecycle(&mut driver, &mut ctx, &Progress::noop())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_MEDTRONIC_UNSUPPORTED");
    assert!(pump.pages_requested.lock().unwrap().is_empty());
    assert!(upload.submitted.lock().unwrap().is_none());
    assert!(pump.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn empty_model_asks_about_serial_and_battery() {
    init_tracing();
    let pump = pump("", Vec::new());
    let mut driver = MedtronicDriver::new(Arc::new(RecordingUpload::default()));
    let mut ctx = context(pump);

    let err = run_lifecycle(&mut driver, &mut ctx, &Progress::noop())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_VALIDATION");
    assert!(err.to_string().contains("correct serial number"));
}

#[tokio::test]
async fn pump_without_history_reports_no_records() {
    init_tracing();
    let pump = pump("723", Vec::new());
    let upload = Arc::new(RecordingUpload::default());
    let mut driver = MedtronicDriver::new(upload.clone());
    let mut ctx = context(pump);

    let err = run_lifecycle(&mut driver, &mut ctx, &Progress::noop())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_NO_RECORDS");
    assert!(upload.submitted.lock().unwrap().is_none());
}

#[tokio::test]
async fn failed_page_read_leaves_bulk_fetch_mode() {
    init_tracing();
    let pump = pump("554", vec![basal_start(8, 40)]);
    *pump.failing_op.lock().unwrap() = Some(Opcode::ReadCbgHistory);
    let upload = Arc::new(RecordingUpload::default());
    let mut driver = MedtronicDriver::new(upload.clone());
    let mut ctx = context(pump.clone());

    let err = run_lifecycle(&mut driver, &mut ctx, &Progress::noop())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "E_COMMUNICATION");
    assert!(!pump.fetching.load(Ordering::SeqCst));
    assert_eq!(pump.control_bytes.load(Ordering::SeqCst), 1);
    assert!(!pump.control_while_fetching.load(Ordering::SeqCst));
    assert!(pump.closed.load(Ordering::SeqCst));
    assert!(upload.submitted.lock().unwrap().is_none());
}
