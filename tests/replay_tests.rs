use durapix::pipeline::{image_pipeline, GRAY_SCALE, RESIZE_IMAGE, WATER_MARK};
use durapix::{run_turn, Action, ActivityError, ErrorKind, Event, TurnResult};

/// Drive an orchestration turn by turn, resolving each scheduled task with
/// the given function, the way the engine does with real activity results.
fn drive(
    mut resolve: impl FnMut(&str, &str) -> Result<String, ActivityError>,
) -> (Vec<Event>, Result<String, ActivityError>) {
    let mut history: Vec<Event> = Vec::new();
    for _ in 0..16 {
        let turn: TurnResult = run_turn(history.clone(), |ctx| image_pipeline(ctx, "uri0".into()));
        assert!(turn.nondeterminism.is_none(), "unexpected nondeterminism");
        history = turn.history;
        if let Some(output) = turn.output {
            return (history, output);
        }
        for action in turn.actions {
            let Action::ScheduleTask { seq, name, input } = action;
            match resolve(&name, &input) {
                Ok(result) => history.push(Event::TaskCompleted { seq, result }),
                Err(error) => history.push(Event::TaskFailed { seq, error }),
            }
        }
    }
    panic!("orchestration did not finish");
}

#[test]
fn pipeline_progresses_one_step_per_turn() {
    let (history, output) = drive(|name, input| Ok(format!("{input}>{name}")));

    assert_eq!(output, Ok("uri0>resizeImage>grayScale".into()));

    let kinds: Vec<(&str, u64)> = history
        .iter()
        .filter_map(|e| match e {
            Event::TaskScheduled { seq, name, .. } => Some((name.as_str(), *seq)),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![(RESIZE_IMAGE, 0), (GRAY_SCALE, 1), (WATER_MARK, 2)]);
}

#[test]
fn completed_history_replays_without_new_decisions() {
    let (history, output) = drive(|name, input| Ok(format!("{input}>{name}")));

    let replay = run_turn(history.clone(), |ctx| image_pipeline(ctx, "uri0".into()));
    assert!(replay.nondeterminism.is_none());
    assert!(replay.actions.is_empty());
    assert_eq!(replay.output, Some(output));
    assert_eq!(replay.history, history);
}

#[test]
fn recorded_failure_propagates_with_its_kind() {
    let (_, output) = drive(|name, input| {
        if name == GRAY_SCALE {
            Err(ActivityError::permanent("bad pixels"))
        } else {
            Ok(format!("{input}>{name}"))
        }
    });

    let err = output.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.message, "bad pixels");
}

#[test]
fn divergent_schedule_is_flagged_not_executed() {
    // History says the first decision was a resize; replay against code that
    // asks for grayscale first must refuse to proceed.
    let history = vec![Event::TaskScheduled { seq: 0, name: RESIZE_IMAGE.into(), input: "uri0".into() }];
    let turn = run_turn(history, |ctx| async move {
        ctx.schedule_activity(GRAY_SCALE, "uri0").await
    });
    assert!(turn.nondeterminism.is_some());
    assert!(turn.actions.is_empty());
    assert!(turn.output.is_none());
}

#[test]
fn stale_extra_history_is_flagged_on_completion() {
    // One more completion recorded than the code consumes.
    let history = vec![
        Event::TaskScheduled { seq: 0, name: RESIZE_IMAGE.into(), input: "uri0".into() },
        Event::TaskCompleted { seq: 0, result: "uri1".into() },
        Event::TaskScheduled { seq: 1, name: GRAY_SCALE.into(), input: "uri1".into() },
        Event::TaskCompleted { seq: 1, result: "uri2".into() },
    ];
    let turn = run_turn(history, |ctx| async move {
        ctx.schedule_activity(RESIZE_IMAGE, "uri0").await
    });
    assert!(turn.nondeterminism.is_some());
    assert!(turn.output.is_none());
}
