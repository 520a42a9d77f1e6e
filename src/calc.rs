use serde::Serialize;

/// Round to 2 decimal places, matching the stored precision of sgpa,
/// attendance percentage and cgpa columns.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Letter grades in descending order of percentage band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    O,
    APlus,
    A,
    BPlus,
    B,
    C,
    P,
    F,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::O => "O",
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::P => "P",
            Grade::F => "F",
        }
    }

    pub fn grade_point(&self) -> f64 {
        match self {
            Grade::O => 10.0,
            Grade::APlus => 9.0,
            Grade::A => 8.0,
            Grade::BPlus => 7.0,
            Grade::B => 6.0,
            Grade::C => 5.0,
            Grade::P => 4.0,
            Grade::F => 0.0,
        }
    }

    /// Closed-open percentage bands, high to low.
    pub fn from_percentage(percentage: f64) -> Grade {
        if percentage >= 90.0 {
            Grade::O
        } else if percentage >= 80.0 {
            Grade::APlus
        } else if percentage >= 70.0 {
            Grade::A
        } else if percentage >= 60.0 {
            Grade::BPlus
        } else if percentage >= 50.0 {
            Grade::B
        } else if percentage >= 45.0 {
            Grade::C
        } else if percentage >= 40.0 {
            Grade::P
        } else {
            Grade::F
        }
    }
}

/// Marking scheme of a subject, as stored in the catalog.
#[derive(Debug, Clone, Copy)]
pub struct SubjectScheme {
    pub max_marks: i64,
    pub passing_marks: i64,
    pub credits: i64,
}

/// Fields derived from a raw marks submission. Recomputed on every save;
/// never settable independently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMarks {
    pub total_marks: i64,
    pub grade: Grade,
    pub grade_point: f64,
    pub is_passed: bool,
}

/// Grade from the percentage band, pass/fail from the subject's own
/// passing threshold. The two checks are independent: a subject whose
/// passing_marks sits below the 40% P band can produce grade F with
/// is_passed true.
pub fn derive_marks(internal: i64, external: i64, scheme: &SubjectScheme) -> DerivedMarks {
    let total_marks = internal + external;
    let grade = if scheme.max_marks == 0 {
        Grade::F
    } else {
        let percentage = (total_marks as f64 / scheme.max_marks as f64) * 100.0;
        Grade::from_percentage(percentage)
    };
    DerivedMarks {
        total_marks,
        grade,
        grade_point: grade.grade_point(),
        is_passed: total_marks >= scheme.passing_marks,
    }
}

/// Attendance percentage. total_classes == 0 degrades to 0 rather than
/// dividing by zero. attended > total is not clamped here; rejecting it
/// is the submission path's job.
pub fn attendance_percentage(total_classes: i64, attended_classes: i64) -> f64 {
    if total_classes <= 0 {
        return 0.0;
    }
    round2((attended_classes as f64 / total_classes as f64) * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Good,
    Average,
    Poor,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Good => "Good",
            AttendanceStatus::Average => "Average",
            AttendanceStatus::Poor => "Poor",
        }
    }
}

pub fn attendance_status(percentage: f64) -> AttendanceStatus {
    if percentage >= 75.0 {
        AttendanceStatus::Good
    } else if percentage >= 60.0 {
        AttendanceStatus::Average
    } else {
        AttendanceStatus::Poor
    }
}

/// One graded subject within a semester, reduced to what the aggregators
/// need.
#[derive(Debug, Clone, Copy)]
pub struct CreditedMark {
    pub grade_point: f64,
    pub credits: i64,
    pub is_passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterSummary {
    pub sgpa: f64,
    pub total_credits: i64,
    pub credits_earned: i64,
}

/// SGPA = Σ(grade_point × credits) / Σ(credits), rounded to 2 decimals.
/// Pure: persisting the summary back onto the semester result row is the
/// caller's responsibility.
pub fn semester_summary<I>(marks: I) -> SemesterSummary
where
    I: IntoIterator<Item = CreditedMark>,
{
    let mut total_credits: i64 = 0;
    let mut credits_earned: i64 = 0;
    let mut weighted_points: f64 = 0.0;

    for m in marks {
        total_credits += m.credits;
        weighted_points += m.grade_point * m.credits as f64;
        if m.is_passed {
            credits_earned += m.credits;
        }
    }

    let sgpa = if total_credits > 0 {
        round2(weighted_points / total_credits as f64)
    } else {
        0.0
    };

    SemesterSummary {
        sgpa,
        total_credits,
        credits_earned,
    }
}

/// CGPA over the union of marks from all published semesters: the same
/// credit-weighted mean, 0.00 when no credits exist.
pub fn cumulative_gpa<I>(marks: I) -> f64
where
    I: IntoIterator<Item = (f64, i64)>,
{
    let mut total_credits: i64 = 0;
    let mut weighted_points: f64 = 0.0;
    for (grade_point, credits) in marks {
        total_credits += credits;
        weighted_points += grade_point * credits as f64;
    }
    if total_credits > 0 {
        round2(weighted_points / total_credits as f64)
    } else {
        0.0
    }
}
