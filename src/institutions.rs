use serde::Serialize;

/// A supported university and its Moodle endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Institution {
    pub id: &'static str,
    pub name: &'static str,
    pub moodle_url: &'static str,
    /// Email domains that map stage-1 logins onto this institution.
    #[serde(skip)]
    pub email_domains: &'static [&'static str],
    pub features: &'static [&'static str],
}

static INSTITUTIONS: &[Institution] = &[
    Institution {
        id: "bgu",
        name: "Ben-Gurion University of the Negev",
        moodle_url: "https://moodle.bgu.ac.il",
        email_domains: &["post.bgu.ac.il", "bgu.ac.il"],
        features: &["courses", "grades", "assignments", "calendar"],
    },
    Institution {
        id: "tau",
        name: "Tel Aviv University",
        moodle_url: "https://moodle.tau.ac.il",
        email_domains: &["mail.tau.ac.il", "tau.ac.il"],
        features: &["courses", "grades", "assignments"],
    },
    Institution {
        id: "huji",
        name: "Hebrew University of Jerusalem",
        moodle_url: "https://moodle.huji.ac.il",
        email_domains: &["mail.huji.ac.il", "huji.ac.il"],
        features: &["courses", "grades"],
    },
];

pub fn all() -> &'static [Institution] {
    INSTITUTIONS
}

pub fn find(id: &str) -> Option<&'static Institution> {
    INSTITUTIONS.iter().find(|i| i.id == id)
}

/// Maps a verified login email onto an institution by its domain part.
pub fn find_by_email_domain(email: &str) -> Option<&'static Institution> {
    let domain = email.rsplit_once('@')?.1;
    INSTITUTIONS.iter().find(|i| {
        i.email_domains
            .iter()
            .any(|d| domain.eq_ignore_ascii_case(d))
    })
}
