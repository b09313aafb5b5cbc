use rand::Rng;

/// A candidate email/password pair for one run.
#[derive(Debug, Clone)]
pub struct Identity {
    pub email: String,
    pub password: String,
}

/// Generate a fresh identity on the given mail domain.
pub fn generate(domain: &str) -> Identity {
    Identity {
        email: format!("{}@{}", generate_local_part(), domain),
        password: generate_password(),
    }
}

/// Random alphanumeric local part, lowercased so it survives mail servers
/// that case-fold addresses.
pub fn generate_local_part() -> String {
    use rand::distributions::Alphanumeric;

    let mut rng = rand::thread_rng();
    let len = rng.gen_range(8..13);
    std::iter::repeat(())
        .map(|()| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}

/// Generate a password with at least one lowercase, uppercase, digit and
/// special character, 16 chars total.
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();

    let lowercase = "abcdefghijklmnopqrstuvwxyz";
    let uppercase = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let numbers = "0123456789";
    let special = "@#$%";

    let mut password = String::new();

    // One of each class up front, the sign-up form rejects weaker ones
    password.push(pick(&mut rng, lowercase));
    password.push(pick(&mut rng, uppercase));
    password.push(pick(&mut rng, numbers));
    password.push(pick(&mut rng, special));

    let all_chars = format!("{}{}{}{}", lowercase, uppercase, numbers, special);
    for _ in 0..12 {
        password.push(pick(&mut rng, &all_chars));
    }

    // Shuffle so the class-guaranteed prefix isn't predictable
    let mut chars: Vec<char> = password.chars().collect();
    for i in 0..chars.len() {
        let j = rng.gen_range(0..chars.len());
        chars.swap(i, j);
    }

    chars.iter().collect()
}

fn pick(rng: &mut impl Rng, chars: &str) -> char {
    chars
        .chars()
        .nth(rng.gen_range(0..chars.len()))
        .unwrap_or('x')
}
