use super::*;
use crate::permissions::{resolve_permissions, Actor};
use crate::validator::Transition;
use chrono::NaiveDate;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("labbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(s: &str) -> TimeOfDay {
    s.parse().unwrap()
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

/// Fresh engine with a bootstrapped admin.
async fn setup(name: &str) -> (Engine, Actor) {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    engine.bootstrap_admin("root", "root@example.edu", "root-secret").await.unwrap();
    let admin = engine.actor_for("root").unwrap();
    (engine, admin)
}

async fn add_user(engine: &Engine, admin: &Actor, username: &str, role: Role) -> Actor {
    let req = NewUser {
        id: None,
        username: username.into(),
        email: format!("{username}@example.edu"),
        role: Some(role),
        password: "lab-secret".into(),
    };
    engine.register_user(Some(admin), req).await.unwrap();
    engine.actor_for(username).unwrap()
}

async fn add_lab(engine: &Engine, admin: &Actor, code: &str, capacity: u32) -> Laboratory {
    let req = NewLaboratory {
        id: None,
        name: format!("Lab {code}"),
        code: code.into(),
        capacity,
        operating_hours: None,
        status: None,
        location: None,
        description: None,
    };
    engine.create_laboratory(admin, req).await.unwrap()
}

fn request(lab: &Laboratory, start: &str, end: &str) -> NewBooking {
    NewBooking {
        id: None,
        laboratory_id: lab.id,
        user_id: None,
        date: day(),
        start: t(start),
        end: t(end),
        attendees: 4,
        purpose: "titration practical".into(),
        notes: None,
    }
}

// ── Bookings ─────────────────────────────────────────────

#[tokio::test]
async fn booking_is_created_pending() {
    let (engine, admin) = setup("created_pending.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "chem1", 20).await;

    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.user_id, teacher.id);
    assert_eq!(engine.laboratory_for_booking(&b.id), Some(lab.id));
}

#[tokio::test]
async fn overlapping_booking_is_rejected() {
    let (engine, admin) = setup("overlap.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;

    let first = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    let err = engine
        .create_booking(&teacher, request(&lab, "09:30", "10:30"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::TimeConflict {
            booking_id: first.id,
            laboratory: "Lab CHEM1".into()
        }
    );

    // Touching endpoints do not conflict.
    engine.create_booking(&teacher, request(&lab, "10:00", "11:00")).await.unwrap();
    engine.create_booking(&teacher, request(&lab, "08:00", "09:00")).await.unwrap();
}

#[tokio::test]
async fn other_days_and_labs_do_not_conflict() {
    let (engine, admin) = setup("other_days.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let chem = add_lab(&engine, &admin, "CHEM1", 20).await;
    let bio = add_lab(&engine, &admin, "BIO1", 20).await;

    engine.create_booking(&teacher, request(&chem, "09:00", "10:00")).await.unwrap();
    engine.create_booking(&teacher, request(&bio, "09:00", "10:00")).await.unwrap();
    let mut next_day = request(&chem, "09:00", "10:00");
    next_day.date = day().succ_opt().unwrap();
    engine.create_booking(&teacher, next_day).await.unwrap();
}

#[tokio::test]
async fn rejected_and_cancelled_bookings_free_the_slot() {
    let (engine, admin) = setup("freed_slot.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;

    let a = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    engine.reject_booking(&admin, a.id, Some("exam week".into())).await.unwrap();
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    engine.cancel_booking(&teacher, b.id).await.unwrap();
    engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
}

#[tokio::test]
async fn hours_capacity_and_range_are_enforced() {
    let (engine, admin) = setup("hours_capacity.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 10).await;

    let err = engine.create_booking(&teacher, request(&lab, "07:30", "09:00")).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::OutsideOperatingHours {
            open: t("08:00"),
            close: t("17:00")
        }
    );
    let err = engine.create_booking(&teacher, request(&lab, "16:00", "17:01")).await.unwrap_err();
    assert!(matches!(err, EngineError::OutsideOperatingHours { .. }));

    let mut crowded = request(&lab, "09:00", "10:00");
    crowded.attendees = 11;
    let err = engine.create_booking(&teacher, crowded).await.unwrap_err();
    assert_eq!(err, EngineError::CapacityExceeded(10));

    let err = engine.create_booking(&teacher, request(&lab, "10:00", "10:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRange { .. }));

    let mut nobody = request(&lab, "09:00", "10:00");
    nobody.attendees = 0;
    assert!(matches!(
        engine.create_booking(&teacher, nobody).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn unavailable_laboratory_rejects_bookings() {
    let (engine, admin) = setup("lab_unavailable.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let patch = LaboratoryPatch {
        status: Patch::Set(LabStatus::Maintenance),
        ..Default::default()
    };
    engine.update_laboratory(&admin, lab.id, patch).await.unwrap();

    let err = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::LaboratoryUnavailable {
            laboratory: "Lab CHEM1".into(),
            status: LabStatus::Maintenance
        }
    );
}

#[tokio::test]
async fn missing_laboratory_is_a_dependency_failure() {
    let (engine, admin) = setup("missing_lab.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    engine.delete_laboratory(&admin, lab.id).await.unwrap();

    let err = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::DependencyUnavailable(_)));
}

#[tokio::test]
async fn booking_requires_permission_and_self_scope() {
    let (engine, admin) = setup("booking_scope.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let other = add_user(&engine, &admin, "ben", Role::Teacher).await;
    let student = add_user(&engine, &admin, "cai", Role::Student).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;

    let err = engine.create_booking(&student, request(&lab, "09:00", "10:00")).await.unwrap_err();
    assert_eq!(err, EngineError::PermissionDenied("create bookings"));

    let mut for_other = request(&lab, "09:00", "10:00");
    for_other.user_id = Some(other.id);
    assert!(matches!(
        engine.create_booking(&teacher, for_other.clone()).await,
        Err(EngineError::PermissionDenied(_))
    ));

    // User managers may book on someone else's behalf.
    let b = engine.create_booking(&admin, for_other).await.unwrap();
    assert_eq!(b.user_id, other.id);
}

#[tokio::test]
async fn update_revalidates_without_conflicting_with_itself() {
    let (engine, admin) = setup("update_self.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    engine.create_booking(&teacher, request(&lab, "11:00", "12:00")).await.unwrap();

    // Sliding over its own old slot is fine.
    let patch = BookingPatch {
        end: Patch::Set(t("10:30")),
        notes: Patch::Set("bring goggles".into()),
        ..Default::default()
    };
    let updated = engine.update_booking(&teacher, b.id, patch).await.unwrap();
    assert_eq!(updated.end, t("10:30"));
    assert_eq!(updated.notes.as_deref(), Some("bring goggles"));

    let patch = BookingPatch {
        end: Patch::Set(t("11:30")),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_booking(&teacher, b.id, patch).await,
        Err(EngineError::TimeConflict { .. })
    ));

    let patch = BookingPatch {
        notes: Patch::Clear,
        ..Default::default()
    };
    assert_eq!(engine.update_booking(&teacher, b.id, patch).await.unwrap().notes, None);

    let patch = BookingPatch {
        purpose: Patch::Clear,
        ..Default::default()
    };
    assert!(matches!(
        engine.update_booking(&teacher, b.id, patch).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn only_pending_bookings_are_editable() {
    let (engine, admin) = setup("editable.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let other = add_user(&engine, &admin, "ben", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();

    let patch = BookingPatch {
        attendees: Patch::Set(6),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_booking(&other, b.id, patch.clone()).await,
        Err(EngineError::PermissionDenied(_))
    ));
    assert!(matches!(
        engine.delete_booking(&other, b.id).await,
        Err(EngineError::PermissionDenied(_))
    ));

    engine.approve_booking(&admin, b.id).await.unwrap();
    assert_eq!(
        engine.update_booking(&teacher, b.id, patch).await,
        Err(EngineError::NotEditable(BookingStatus::Approved))
    );
    assert_eq!(
        engine.delete_booking(&teacher, b.id).await,
        Err(EngineError::NotEditable(BookingStatus::Approved))
    );

    // Admins may delete in any state.
    engine.delete_booking(&admin, b.id).await.unwrap();
    assert_eq!(engine.laboratory_for_booking(&b.id), None);
}

#[tokio::test]
async fn owner_deletes_pending_booking() {
    let (engine, admin) = setup("owner_delete.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();

    engine.delete_booking(&teacher, b.id).await.unwrap();
    assert_eq!(
        engine.get_booking(&teacher, b.id).await,
        Err(EngineError::NotFound("booking", b.id))
    );
    engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
}

#[tokio::test]
async fn status_transitions() {
    let (engine, admin) = setup("transitions.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let a = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    let b = engine.create_booking(&teacher, request(&lab, "10:00", "11:00")).await.unwrap();

    assert_eq!(
        engine.approve_booking(&teacher, a.id).await,
        Err(EngineError::PermissionDenied("approve bookings"))
    );

    let approved = engine.approve_booking(&admin, a.id).await.unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);
    assert_eq!(approved.processed_by, Some(admin.id));
    assert!(approved.processed_at.is_some());
    assert_eq!(
        engine.reject_booking(&admin, a.id, None).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Approved,
            transition: Transition::Reject
        })
    );
    let cancelled = engine.cancel_booking(&teacher, a.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    let rejected = engine.reject_booking(&admin, b.id, Some("  lab cleaning ".into())).await.unwrap();
    assert_eq!(rejected.rejection_reason.as_deref(), Some("lab cleaning"));
    assert_eq!(
        engine.cancel_booking(&teacher, b.id).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Rejected,
            transition: Transition::Cancel
        })
    );
    assert!(matches!(
        engine.approve_booking(&admin, b.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn stranger_cannot_cancel() {
    let (engine, admin) = setup("stranger_cancel.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let other = add_user(&engine, &admin, "ben", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();

    assert!(matches!(
        engine.cancel_booking(&other, b.id).await,
        Err(EngineError::PermissionDenied(_))
    ));
    engine.cancel_booking(&admin, b.id).await.unwrap();
}

#[tokio::test]
async fn bookings_never_return_to_pending() {
    let (engine, admin) = setup("reopen.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let other = add_user(&engine, &admin, "ben", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();

    assert!(matches!(
        engine.reopen_booking(&other, b.id).await,
        Err(EngineError::PermissionDenied(_))
    ));
    assert_eq!(
        engine.reopen_booking(&teacher, b.id).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Pending,
            transition: Transition::Reopen
        })
    );
    engine.approve_booking(&admin, b.id).await.unwrap();
    assert_eq!(
        engine.reopen_booking(&admin, b.id).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Approved,
            transition: Transition::Reopen
        })
    );
    assert_eq!(engine.get_booking(&admin, b.id).await.unwrap().status, BookingStatus::Approved);
}

#[tokio::test]
async fn concurrent_overlapping_requests_admit_exactly_one() {
    let (engine, admin) = setup("race.wal").await;
    let engine = Arc::new(engine);
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;

    let mut handles = Vec::new();
    for i in 0..16u16 {
        let engine = engine.clone();
        let teacher = teacher.clone();
        let mut req = request(&lab, "09:00", "10:00");
        // Every request overlaps every other one.
        req.start = TimeOfDay::from_hm(9, i).unwrap();
        req.end = TimeOfDay::from_hm(10, i).unwrap();
        handles.push(tokio::spawn(async move { engine.create_booking(&teacher, req).await }));
    }

    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(matches!(e, EngineError::TimeConflict { .. }), "{e}"),
        }
    }
    assert_eq!(admitted, 1);
    let live = engine
        .find_bookings(lab.id, day(), &[BookingStatus::Pending, BookingStatus::Approved], None)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn concurrent_disjoint_requests_all_succeed() {
    let (engine, admin) = setup("race_disjoint.wal").await;
    let engine = Arc::new(engine);
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;

    let mut handles = Vec::new();
    for hour in 8..17u16 {
        let engine = engine.clone();
        let teacher = teacher.clone();
        let mut req = request(&lab, "09:00", "10:00");
        req.start = TimeOfDay::from_hm(hour, 0).unwrap();
        req.end = TimeOfDay::from_hm(hour + 1, 0).unwrap();
        handles.push(tokio::spawn(async move { engine.create_booking(&teacher, req).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    let all = engine
        .find_bookings(lab.id, day(), &[BookingStatus::Pending], None)
        .await
        .unwrap();
    assert_eq!(all.len(), 9);
    assert!(all.windows(2).all(|w| w[0].start < w[1].start));
}

#[tokio::test]
async fn concurrent_same_id_in_two_labs_admits_one() {
    let (engine, admin) = setup("race_same_id.wal").await;
    let engine = Arc::new(engine);
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let labs = [
        add_lab(&engine, &admin, "CHEM1", 20).await,
        add_lab(&engine, &admin, "PHYS1", 20).await,
    ];
    let id = Ulid::new();

    let mut handles = Vec::new();
    for round in 0..8 {
        let lab = &labs[round % 2];
        let engine = engine.clone();
        let teacher = teacher.clone();
        let mut req = request(lab, "09:00", "10:00");
        req.id = Some(id);
        let lab_id = lab.id;
        handles.push(tokio::spawn(async move {
            (lab_id, engine.create_booking(&teacher, req).await)
        }));
    }

    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            (lab_id, Ok(_)) => winners.push(lab_id),
            (_, Err(e)) => assert!(
                matches!(e, EngineError::AlreadyExists("booking", _) | EngineError::TimeConflict { .. }),
                "{e}"
            ),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(engine.laboratory_for_booking(&id), Some(winners[0]));
    let booking = engine.get_booking(&admin, id).await.unwrap();
    assert_eq!(booking.laboratory_id, winners[0]);
    for lab in &labs {
        let live = engine.find_bookings(lab.id, day(), &[BookingStatus::Pending], None).await.unwrap();
        assert_eq!(live.len(), usize::from(lab.id == winners[0]));
    }
}

#[tokio::test]
async fn rejected_request_releases_its_id() {
    let (engine, admin) = setup("release_id.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let id = Ulid::new();

    let mut late = request(&lab, "18:00", "19:00");
    late.id = Some(id);
    assert!(matches!(
        engine.create_booking(&teacher, late).await,
        Err(EngineError::OutsideOperatingHours { .. })
    ));
    assert_eq!(engine.laboratory_for_booking(&id), None);

    let mut ok = request(&lab, "09:00", "10:00");
    ok.id = Some(id);
    assert_eq!(engine.create_booking(&teacher, ok).await.unwrap().id, id);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn find_bookings_filters_status_and_exclusion() {
    let (engine, admin) = setup("find_bookings.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let a = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    let b = engine.create_booking(&teacher, request(&lab, "10:00", "11:00")).await.unwrap();
    engine.reject_booking(&admin, b.id, None).await.unwrap();

    let live = [BookingStatus::Pending, BookingStatus::Approved];
    let found = engine.find_bookings(lab.id, day(), &live, None).await.unwrap();
    assert_eq!(found.iter().map(|b| b.id).collect::<Vec<_>>(), vec![a.id]);
    assert!(engine.find_bookings(lab.id, day(), &live, Some(a.id)).await.unwrap().is_empty());
    assert_eq!(
        engine.find_bookings(Ulid::new(), day(), &live, None).await.unwrap_err().kind(),
        "not_found"
    );
}

#[tokio::test]
async fn listings_are_self_scoped() {
    let (engine, admin) = setup("list_scope.wal").await;
    let ana = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let ben = add_user(&engine, &admin, "ben", Role::Teacher).await;
    let student = add_user(&engine, &admin, "cai", Role::Student).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let mine = engine.create_booking(&ana, request(&lab, "09:00", "10:00")).await.unwrap();
    engine.create_booking(&ben, request(&lab, "10:00", "11:00")).await.unwrap();

    let listed = engine.list_bookings(&ana, BookingFilter::default()).await.unwrap();
    assert_eq!(listed, vec![mine.clone()]);
    let all = engine.list_bookings(&admin, BookingFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let theirs = BookingFilter {
        user_id: Some(ben.id),
        ..Default::default()
    };
    assert!(matches!(
        engine.list_bookings(&ana, theirs).await,
        Err(EngineError::PermissionDenied(_))
    ));
    assert!(matches!(
        engine.list_bookings(&student, BookingFilter::default()).await,
        Err(EngineError::PermissionDenied(_))
    ));
    assert!(matches!(
        engine.get_booking(&ben, mine.id).await,
        Err(EngineError::PermissionDenied(_))
    ));
    assert_eq!(engine.get_booking(&admin, mine.id).await.unwrap(), mine);
}

#[tokio::test]
async fn calendar_hides_owners_from_public_viewers() {
    let (engine, admin) = setup("calendar.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let student = add_user(&engine, &admin, "cai", Role::Student).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    let gone = engine.create_booking(&teacher, request(&lab, "11:00", "12:00")).await.unwrap();
    engine.cancel_booking(&teacher, gone.id).await.unwrap();

    let public = engine.calendar(None, lab.id, day()).await.unwrap();
    assert_eq!(public.len(), 1);
    assert_eq!(public[0].booking_id, b.id);
    assert_eq!(public[0].owner, None);
    assert_eq!(public[0].purpose, None);

    let as_student = engine.calendar(Some(&student), lab.id, day()).await.unwrap();
    assert_eq!(as_student[0].owner, None);

    let detailed = engine.calendar(Some(&teacher), lab.id, day()).await.unwrap();
    assert_eq!(detailed[0].owner, Some(teacher.id));
    assert_eq!(detailed[0].purpose.as_deref(), Some("titration practical"));
}

#[tokio::test]
async fn availability_lists_free_windows() {
    let (engine, admin) = setup("availability.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
    engine.create_booking(&teacher, request(&lab, "10:30", "16:00")).await.unwrap();

    let free = engine.availability(None, lab.id, day(), None).await.unwrap();
    let text: Vec<String> = free.iter().map(|w| format!("{}-{}", w.start, w.end)).collect();
    assert_eq!(text, ["08:00-09:00", "10:00-10:30", "16:00-17:00"]);

    let long = engine.availability(None, lab.id, day(), Some(60)).await.unwrap();
    assert_eq!(long.len(), 2);

    let patch = LaboratoryPatch {
        status: Patch::Set(LabStatus::Closed),
        ..Default::default()
    };
    engine.update_laboratory(&admin, lab.id, patch).await.unwrap();
    assert!(engine.availability(None, lab.id, day(), None).await.unwrap().is_empty());
}

// ── Laboratories ─────────────────────────────────────────

#[tokio::test]
async fn laboratory_codes_are_uppercase_and_unique() {
    let (engine, admin) = setup("lab_codes.wal").await;
    let lab = add_lab(&engine, &admin, " chem1 ", 20).await;
    assert_eq!(lab.code, "CHEM1");
    assert_eq!(lab.operating_hours, OperatingHours::default());

    let dup = NewLaboratory {
        id: None,
        name: "Other".into(),
        code: "Chem1".into(),
        capacity: 5,
        operating_hours: None,
        status: None,
        location: None,
        description: None,
    };
    assert_eq!(
        engine.create_laboratory(&admin, dup.clone()).await,
        Err(EngineError::AlreadyExists("laboratory code", "CHEM1".into()))
    );
    let too_long = NewLaboratory {
        code: "ABCDEFGHIJK".into(),
        ..dup.clone()
    };
    assert!(matches!(
        engine.create_laboratory(&admin, too_long).await,
        Err(EngineError::InvalidInput(_))
    ));
    let empty = NewLaboratory {
        code: "EMPTY".into(),
        capacity: 0,
        ..dup
    };
    assert!(matches!(
        engine.create_laboratory(&admin, empty).await,
        Err(EngineError::InvalidInput(_))
    ));

    let renamed = LaboratoryPatch {
        code: Patch::Set("chem2".into()),
        ..Default::default()
    };
    engine.update_laboratory(&admin, lab.id, renamed).await.unwrap();
    assert_eq!(engine.get_laboratory(lab.id).await.unwrap().code, "CHEM2");
    // The old code is free again.
    add_lab(&engine, &admin, "CHEM1", 20).await;
}

#[tokio::test]
async fn laboratory_management_requires_permission() {
    let (engine, admin) = setup("lab_perm.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    assert_eq!(
        engine.delete_laboratory(&teacher, lab.id).await,
        Err(EngineError::PermissionDenied("manage laboratories"))
    );
    assert!(matches!(
        engine
            .update_laboratory(&teacher, lab.id, LaboratoryPatch::default())
            .await,
        Err(EngineError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn clearing_hours_restores_defaults() {
    let (engine, admin) = setup("lab_hours.wal").await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let patch = LaboratoryPatch {
        open: Patch::Set(t("07:00")),
        close: Patch::Set(t("21:00")),
        location: Patch::Set("Block C".into()),
        ..Default::default()
    };
    let lab2 = engine.update_laboratory(&admin, lab.id, patch).await.unwrap();
    assert_eq!(lab2.operating_hours.open, t("07:00"));
    assert_eq!(lab2.location.as_deref(), Some("Block C"));

    let patch = LaboratoryPatch {
        open: Patch::Clear,
        close: Patch::Clear,
        location: Patch::Clear,
        ..Default::default()
    };
    let lab3 = engine.update_laboratory(&admin, lab.id, patch).await.unwrap();
    assert_eq!(lab3.operating_hours, OperatingHours::default());
    assert_eq!(lab3.location, None);

    let inverted = LaboratoryPatch {
        open: Patch::Set(t("18:00")),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_laboratory(&admin, lab.id, inverted).await,
        Err(EngineError::InvalidInput(_))
    ));
    let no_name = LaboratoryPatch {
        name: Patch::Clear,
        ..Default::default()
    };
    assert!(matches!(
        engine.update_laboratory(&admin, lab.id, no_name).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn laboratory_with_live_bookings_cannot_be_deleted() {
    let (engine, admin) = setup("lab_delete.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();

    assert_eq!(
        engine.delete_laboratory(&admin, lab.id).await,
        Err(EngineError::HasActiveBookings(lab.id))
    );
    engine.cancel_booking(&teacher, b.id).await.unwrap();
    engine.delete_laboratory(&admin, lab.id).await.unwrap();

    assert_eq!(engine.laboratory_for_booking(&b.id), None);
    assert!(engine.list_laboratories().await.is_empty());
    assert_eq!(
        engine.get_laboratory(lab.id).await,
        Err(EngineError::NotFound("laboratory", lab.id))
    );
    // Code is reusable.
    add_lab(&engine, &admin, "CHEM1", 20).await;
}

// ── Users ────────────────────────────────────────────────

#[tokio::test]
async fn self_registration_is_always_student() {
    let (engine, admin) = setup("self_register.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;

    let req = NewUser {
        id: None,
        username: "mallory".into(),
        email: "mallory@example.edu".into(),
        role: Some(Role::Admin),
        password: "lab-secret".into(),
    };
    let user = engine.register_user(None, req).await.unwrap();
    assert_eq!(user.role, Role::Student);
    assert_eq!(user.permissions, resolve_permissions(Role::Student));

    let req = NewUser {
        id: None,
        username: "trent".into(),
        email: "trent@example.edu".into(),
        role: Some(Role::Admin),
        password: "lab-secret".into(),
    };
    assert_eq!(engine.register_user(Some(&teacher), req).await.unwrap().role, Role::Student);

    assert_eq!(teacher.permissions, resolve_permissions(Role::Teacher));
}

#[tokio::test]
async fn usernames_and_emails_are_unique() {
    let (engine, admin) = setup("user_unique.wal").await;
    add_user(&engine, &admin, "ana", Role::Teacher).await;

    let same_name = NewUser {
        id: None,
        username: "ANA".into(),
        email: "other@example.edu".into(),
        role: None,
        password: "lab-secret".into(),
    };
    assert!(matches!(
        engine.register_user(None, same_name).await,
        Err(EngineError::AlreadyExists("username", _))
    ));
    let same_email = NewUser {
        id: None,
        username: "ana2".into(),
        email: "Ana@Example.edu".into(),
        role: None,
        password: "lab-secret".into(),
    };
    assert!(matches!(
        engine.register_user(None, same_email).await,
        Err(EngineError::AlreadyExists("email", _))
    ));
}

#[tokio::test]
async fn bootstrap_only_on_empty_store() {
    let (engine, _admin) = setup("bootstrap.wal").await;
    assert_eq!(engine.bootstrap_admin("root2", "root2@example.edu", "root2-secret").await, Ok(None));
    assert_eq!(engine.user_count(), 1);
}

#[tokio::test]
async fn role_changes_are_admin_only_and_recompute_permissions() {
    let (engine, admin) = setup("role_change.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let student = add_user(&engine, &admin, "cai", Role::Student).await;

    let promote = UserPatch {
        role: Patch::Set(Role::Admin),
        ..Default::default()
    };
    assert_eq!(
        engine.update_user(&teacher, teacher.id, promote.clone()).await,
        Err(EngineError::RoleElevationDenied)
    );

    let rename = UserPatch {
        email: Patch::Set("ana.lima@example.edu".into()),
        ..Default::default()
    };
    assert_eq!(
        engine.update_user(&teacher, teacher.id, rename.clone()).await.unwrap().email,
        "ana.lima@example.edu"
    );
    assert!(matches!(
        engine.update_user(&student, teacher.id, rename).await,
        Err(EngineError::PermissionDenied(_))
    ));

    let to_teacher = UserPatch {
        role: Patch::Set(Role::Teacher),
        ..Default::default()
    };
    let user = engine.update_user(&admin, student.id, to_teacher).await.unwrap();
    assert_eq!(user.permissions, resolve_permissions(Role::Teacher));
    assert!(engine.actor_for("cai").unwrap().permissions.can_create_bookings);
}

#[tokio::test]
async fn last_admin_is_protected() {
    let (engine, admin) = setup("last_admin.wal").await;
    let demote = UserPatch {
        role: Patch::Set(Role::Teacher),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_user(&admin, admin.id, demote.clone()).await,
        Err(EngineError::InvalidInput(_))
    ));

    add_user(&engine, &admin, "second", Role::Admin).await;
    engine.update_user(&admin, admin.id, demote).await.unwrap();
}

#[tokio::test]
async fn inactive_users_resolve_to_no_actor() {
    let (engine, admin) = setup("inactive.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let deactivate = UserPatch {
        is_active: Patch::Set(false),
        ..Default::default()
    };
    engine.update_user(&admin, teacher.id, deactivate).await.unwrap();
    assert!(engine.actor_for("ana").is_none());
    assert!(engine.actor_for("nobody").is_none());
    assert!(engine.actor_for("ROOT").is_some());
}

#[tokio::test]
async fn accounts_log_in_with_their_own_password() {
    let (engine, admin) = setup("login.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;

    assert_eq!(engine.authenticate("ana", "lab-secret").map(|a| a.id), Some(teacher.id));
    assert_eq!(engine.authenticate("ANA", "lab-secret").map(|a| a.id), Some(teacher.id));
    assert!(engine.authenticate("ana", "root-secret").is_none());
    assert!(engine.authenticate("root", "lab-secret").is_none());
    assert!(engine.authenticate("nobody", "lab-secret").is_none());
    assert!(!engine.user(teacher.id).unwrap().password_hash.contains("lab-secret"));

    let change = UserPatch {
        password: Patch::Set("new-lab-secret".into()),
        ..Default::default()
    };
    engine.update_user(&admin, teacher.id, change).await.unwrap();
    assert!(engine.authenticate("ana", "lab-secret").is_none());
    assert!(engine.authenticate("ana", "new-lab-secret").is_some());

    let clear = UserPatch {
        password: Patch::Clear,
        ..Default::default()
    };
    assert!(engine.update_user(&admin, teacher.id, clear).await.is_err());
    let short = UserPatch {
        password: Patch::Set("short".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_user(&admin, teacher.id, short).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(engine.authenticate("ana", "new-lab-secret").is_some());

    let deactivate = UserPatch {
        is_active: Patch::Set(false),
        ..Default::default()
    };
    engine.update_user(&admin, teacher.id, deactivate).await.unwrap();
    assert!(engine.authenticate("ana", "new-lab-secret").is_none());
    assert!(engine.is_registered("ana"));
    assert!(engine.actor(teacher.id).is_none());
}

#[tokio::test]
async fn login_survives_replay() {
    let path = test_wal_path("login_replay.wal");
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.bootstrap_admin("root", "root@example.edu", "root-secret").await.unwrap();
    }
    let engine = Engine::new(path).unwrap();
    assert!(engine.authenticate("root", "root-secret").is_some());
    assert!(engine.authenticate("root", "labbook").is_none());
}

#[tokio::test]
async fn permission_override_is_admin_only() {
    let (engine, admin) = setup("override.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let granted = PermissionSet {
        can_approve_bookings: true,
        ..teacher.permissions
    };

    assert_eq!(
        engine.override_permissions(&teacher, teacher.id, granted).await,
        Err(EngineError::RoleElevationDenied)
    );
    engine.override_permissions(&admin, teacher.id, granted).await.unwrap();
    let actor = engine.actor_for("ana").unwrap();
    assert!(actor.permissions.can_approve_bookings);
    assert_eq!(actor.role, Role::Teacher);
}

#[tokio::test]
async fn delete_user_rules() {
    let (engine, admin) = setup("delete_user.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
    let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();

    assert!(matches!(
        engine.delete_user(&teacher, admin.id).await,
        Err(EngineError::PermissionDenied(_))
    ));
    assert!(matches!(
        engine.delete_user(&admin, admin.id).await,
        Err(EngineError::InvalidInput(_))
    ));
    engine.delete_user(&admin, teacher.id).await.unwrap();
    assert!(engine.actor_for("ana").is_none());
    assert_eq!(
        engine.get_user(Some(&admin), teacher.id),
        Err(EngineError::NotFound("user", teacher.id))
    );
    // Bookings outlive their owner.
    assert_eq!(engine.get_booking(&admin, b.id).await.unwrap().user_id, teacher.id);
}

#[tokio::test]
async fn user_queries_are_scoped() {
    let (engine, admin) = setup("user_queries.wal").await;
    let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
    assert_eq!(engine.list_users(Some(&admin)).unwrap().len(), 2);
    assert!(matches!(engine.list_users(Some(&teacher)), Err(EngineError::PermissionDenied(_))));
    assert!(matches!(engine.list_users(None), Err(EngineError::PermissionDenied(_))));
    assert_eq!(engine.get_user(Some(&teacher), teacher.id).unwrap().username, "ana");
    assert!(matches!(
        engine.get_user(Some(&teacher), admin.id),
        Err(EngineError::PermissionDenied(_))
    ));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (lab_id, booking_id, teacher_id);
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.bootstrap_admin("root", "root@example.edu", "root-secret").await.unwrap();
        let admin = engine.actor_for("root").unwrap();
        let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
        let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
        let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
        engine.approve_booking(&admin, b.id).await.unwrap();
        let renamed = LaboratoryPatch {
            code: Patch::Set("CHEM9".into()),
            ..Default::default()
        };
        engine.update_laboratory(&admin, lab.id, renamed).await.unwrap();
        let gone = add_lab(&engine, &admin, "GONE", 5).await;
        engine.delete_laboratory(&admin, gone.id).await.unwrap();
        (lab_id, booking_id, teacher_id) = (lab.id, b.id, teacher.id);
    }

    let engine = Engine::new(path).unwrap();
    let admin = engine.actor_for("root").unwrap();
    let labs = engine.list_laboratories().await;
    assert_eq!(labs.len(), 1);
    assert_eq!(labs[0].code, "CHEM9");
    let b = engine.get_booking(&admin, booking_id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Approved);
    assert_eq!(b.user_id, teacher_id);
    assert_eq!(engine.laboratory_for_booking(&booking_id), Some(lab_id));
    assert_eq!(engine.actor_for("ana").unwrap().id, teacher_id);

    // Replayed state still enforces conflicts.
    let teacher = engine.actor_for("ana").unwrap();
    let lab = engine.get_laboratory(lab_id).await.unwrap();
    assert!(matches!(
        engine.create_booking(&teacher, request(&lab, "09:30", "10:30")).await,
        Err(EngineError::TimeConflict { .. })
    ));
}

#[tokio::test]
async fn compaction_preserves_state_and_survives_restart() {
    let path = test_wal_path("compact.wal");
    let lab_id;
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.bootstrap_admin("root", "root@example.edu", "root-secret").await.unwrap();
        let admin = engine.actor_for("root").unwrap();
        let teacher = add_user(&engine, &admin, "ana", Role::Teacher).await;
        let lab = add_lab(&engine, &admin, "CHEM1", 20).await;
        lab_id = lab.id;
        for _ in 0..10 {
            let b = engine.create_booking(&teacher, request(&lab, "09:00", "10:00")).await.unwrap();
            engine.delete_booking(&teacher, b.id).await.unwrap();
        }
        engine.create_booking(&teacher, request(&lab, "13:00", "14:00")).await.unwrap();
        assert!(engine.appends_since_compact().await.unwrap() > 20);

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL ({after}) should be smaller than ({before})");
        assert_eq!(engine.appends_since_compact().await.unwrap(), 0);

        // Appends after compaction land in the new log.
        engine.create_booking(&teacher, request(&lab, "15:00", "16:00")).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let starts: Vec<String> = engine
        .find_bookings(lab_id, day(), &[BookingStatus::Pending], None)
        .await
        .unwrap()
        .iter()
        .map(|b| b.start.to_string())
        .collect();
    assert_eq!(starts, ["13:00", "15:00"]);
    assert_eq!(engine.user_count(), 2);
}
